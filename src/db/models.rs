use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chunker::{Chunk, ChunkKind};

/// A chunk paired with its embedding, ready to be written.
#[derive(Debug, Clone)]
pub struct ChunkWithEmbedding {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// Filters for similarity and lexical search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Drop results scoring below this.
    pub threshold: Option<f64>,
    pub kind: Option<ChunkKind>,
    pub language: Option<String>,
    /// Only paths starting with this prefix.
    pub path_prefix: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: None,
            kind: None,
            language: None,
            path_prefix: None,
        }
    }
}

/// Filters for listing stored chunks. A `limit` of zero lists everything.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub file_path: Option<String>,
    pub kind: Option<ChunkKind>,
    pub language: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    /// Similarity in `[0, 1]` for vector search; BM25 relevance (higher is
    /// better) for lexical search.
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub files_indexed: usize,
    pub chunks_total: usize,
    /// Filled in by the indexer; storage does not know the model.
    pub embedding_model: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}
