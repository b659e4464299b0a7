//! Text embedding contract and the in-process implementations.
pub mod mock;
pub mod offline;

pub use mock::MockEmbedder;
pub use offline::{KeywordEmbedder, OfflineEmbedder};

use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    /// The provider could not be reached. The offline fallback keys on this.
    #[error("network error: {0}")]
    Network(String),

    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbedderError {
    pub fn is_network(&self) -> bool {
        matches!(self, EmbedderError::Network(_))
    }
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Calls block; async callers run them on a blocking thread.
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed multiple texts. The output is 1:1 with `texts`, in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Model identifier, for diagnostics.
    fn model(&self) -> &str;
}

/// Scales `v` to unit length in place. Zero vectors are left alone.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}
