//! Reusable byte buffers for vector encode/decode.
use std::ops::Deref;
use std::sync::Mutex;

const DEFAULT_POOL_SIZE: usize = 8;

/// A bounded pool of byte buffers. Buffers are acquired around one
/// encode/decode cycle and handed back on drop; when the pool is already full
/// the returned buffer is simply freed.
#[derive(Debug)]
pub struct VectorBufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl VectorBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// An empty buffer, reused when one is idle.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .buffers
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_default();
        PooledBuffer { buf, pool: self }
    }

    /// Encode `vector` as little-endian `f32` bytes, the layout vec0 expects.
    pub fn encode(&self, vector: &[f32]) -> PooledBuffer<'_> {
        let mut pooled = self.acquire();
        pooled.buf.reserve(vector.len() * 4);
        for v in vector {
            pooled.buf.extend_from_slice(&v.to_le_bytes());
        }
        pooled
    }

    /// Idle buffers currently held.
    pub fn available(&self) -> usize {
        self.buffers.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Ok(mut idle) = self.buffers.lock() {
            if idle.len() < self.capacity {
                idle.push(buf);
            }
        }
    }
}

impl Default for VectorBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

/// A buffer on loan from a [`VectorBufferPool`].
pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a VectorBufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

/// Decode little-endian `f32` bytes; a trailing partial value is ignored.
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
