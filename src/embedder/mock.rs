/// Mock embedder for tests.
///
/// Generates deterministic embeddings from a hash of the text, counts calls
/// and can be told to fail on texts containing a marker.
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Embedder, EmbedderError, l2_normalize};

pub struct MockEmbedder {
    pub dimensions: usize,
    fail_marker: Option<String>,
    network_failure: bool,
    batch_calls: AtomicUsize,
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail_marker: None,
            network_failure: false,
            batch_calls: AtomicUsize::new(0),
        }
    }

    /// Fail any call whose input contains `marker` with an inference error.
    #[must_use]
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Report injected failures as network errors instead.
    #[must_use]
    pub fn as_network_failure(mut self) -> Self {
        self.network_failure = true;
        self
    }

    /// Number of `embed_batch` calls so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn check(&self, text: &str) -> Result<(), EmbedderError> {
        match &self.fail_marker {
            Some(marker) if text.contains(marker.as_str()) => {
                let msg = format!("refusing input containing {marker:?}");
                if self.network_failure {
                    Err(EmbedderError::Network(msg))
                } else {
                    Err(EmbedderError::InferenceFailed(msg))
                }
            }
            _ => Ok(()),
        }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Embedder for MockEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.check(text)?;

        // Each group of 8 components is seeded by its own hash
        let mut embedding = Vec::with_capacity(self.dimensions);
        let mut block = 0u64;
        while embedding.len() < self.dimensions {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            block.hash(&mut hasher);
            for byte in hasher.finish().to_le_bytes() {
                if embedding.len() == self.dimensions {
                    break;
                }
                embedding.push(f32::from(byte) / 255.0);
            }
            block += 1;
        }

        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        "mock"
    }
}
