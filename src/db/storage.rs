//! Storage contract consumed by the indexer.
use thiserror::Error;

use super::models::{ChunkWithEmbedding, IndexStats, ListOptions, SearchOptions, SearchResult};
use crate::chunker::Chunk;

/// Errors surfaced by a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk not found: {0}")]
    NotFound(String),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Backend(String),
}

/// Durable home for chunks, their vectors and per-file checkpoints.
///
/// Backends with a full-text index must mirror every chunk mutation into it
/// within the same operation, so a chunk is never visible to one kind of
/// search and missing from the other.
pub trait Storage: Send + Sync {
    /// Store one chunk. IDs are expected to be fresh.
    fn create(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError>;

    /// Store many chunks as one unit.
    fn create_batch(&self, items: &[ChunkWithEmbedding]) -> Result<(), StorageError>;

    fn read(&self, id: &str) -> Result<Option<Chunk>, StorageError>;

    /// Replace the stored chunk with the same ID.
    fn update(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError>;

    /// Returns whether a chunk was removed.
    fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Remove every chunk of `file_path`, returning how many went.
    fn delete_by_file_path(&self, file_path: &str) -> Result<usize, StorageError>;

    fn list(&self, opts: &ListOptions) -> Result<Vec<Chunk>, StorageError>;

    /// Every path with chunks or a checkpoint.
    fn list_file_paths(&self) -> Result<Vec<String>, StorageError>;

    /// Nearest chunks to `query` by vector similarity.
    fn search(&self, query: &[f32], opts: &SearchOptions)
    -> Result<Vec<SearchResult>, StorageError>;

    fn stats(&self) -> Result<IndexStats, StorageError>;

    /// Wipe all chunks and checkpoints.
    fn clear(&self) -> Result<(), StorageError>;

    /// Checkpointed content hash for `file_path`; `None` means not indexed.
    fn get_file_hash(&self, file_path: &str) -> Result<Option<String>, StorageError>;

    fn set_file_hash(&self, file_path: &str, hash: &str) -> Result<(), StorageError>;

    fn delete_file_hash(&self, file_path: &str) -> Result<(), StorageError>;
}

/// Keyword search over the chunks a [`Storage`] holds.
pub trait LexicalSearcher: Send + Sync {
    fn lexical_search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, StorageError>;
}
