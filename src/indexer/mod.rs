//! Walks a source tree, chunks changed files, embeds the chunks and commits
//! them to storage with per-file checkpoints.
pub mod core;
pub mod discovery;
pub mod hash;

pub use self::core::IndexManager;
pub use discovery::{FileDiscovery, TEST_DIR_PATTERNS, TEST_FILE_PATTERNS};
pub use hash::{ContentHashGate, content_hash};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::chunker::ChunkError;
use crate::db::StorageError;
use crate::embedder::EmbedderError;

/// Emitted once per discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// 1-based position among discovered files.
    pub current: usize,
    pub total: usize,
    pub file_path: String,
    /// Chunks created (or pending, in cross-file mode) so far.
    pub chunks_total: usize,
    /// The file was unchanged since its last checkpoint.
    pub skipped: bool,
}

/// Emitted after each committed cross-file batch.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgressEvent {
    pub phase: &'static str,
    /// 1-based batch number.
    pub current: usize,
    pub total: usize,
    pub chunks_uploaded: usize,
    pub chunks_total: usize,
    pub batch_size: usize,
    pub elapsed: Duration,
    /// Average time per committed batch times the batches left.
    pub eta: Duration,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
pub type UploadProgressCallback = Arc<dyn Fn(&UploadProgressEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct IndexOptions {
    /// Globs a file must match (any). Empty means every file.
    pub includes: Vec<String>,
    /// Globs for files and directories to leave out. These win over includes.
    pub excludes: Vec<String>,
    /// Also leave out common test files and test directories.
    pub exclude_tests: bool,
    /// Wipe the index and re-process every file.
    pub force: bool,
    /// Chunks per storage write; zero writes each commit in one call.
    pub batch_size: usize,
    /// Concurrent storage writes per commit; zero or one is sequential.
    pub parallel: usize,
    /// Target chunks per embedding call across files; zero embeds per file.
    pub embed_batch_size: usize,
    /// Stamped onto every chunk produced by the run.
    pub domain: Option<String>,
    pub on_progress: Option<ProgressCallback>,
    pub on_upload_progress: Option<UploadProgressCallback>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub exclude_tests: bool,
    pub batch_size: usize,
    pub parallel: usize,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexResult {
    pub files_processed: usize,
    /// Files that failed; see `errors`.
    pub files_skipped: usize,
    /// Files whose checkpoint matched their content.
    pub files_unchanged: usize,
    pub chunks_created: usize,
    /// `"<path>: <error>"` for each failed file.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub files_updated: usize,
    pub files_removed: usize,
    pub chunks_created: usize,
    pub chunks_removed: usize,
    pub errors: Vec<String>,
}

/// Errors that abort an `index` or `update` run.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to access path {path}: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to generate embeddings (batch {batch}): {source}")]
    Embedding {
        batch: usize,
        #[source]
        source: EmbedderError,
    },

    #[error("failed to store chunks (batch {batch}): {source}")]
    Store {
        batch: usize,
        #[source]
        source: StorageError,
    },

    #[error("embedder returned {actual} vectors for {expected} chunks (batch {batch})")]
    EmbeddingCount {
        batch: usize,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("indexing cancelled")]
    Cancelled,
}

/// Why a single file could not be indexed. Recorded, never fatal.
#[derive(Error, Debug)]
pub(crate) enum FileError {
    #[error("no chunker for file type")]
    NoChunker,

    #[error("failed to read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to chunk file: {0}")]
    Chunk(#[from] ChunkError),

    #[error("no chunks produced")]
    Empty,

    #[error("failed to generate embeddings: {0}")]
    Embed(#[from] EmbedderError),

    #[error("embedder returned {actual} vectors for {expected} chunks")]
    EmbeddingCount { expected: usize, actual: usize },

    #[error("failed to store chunks: {0}")]
    Store(#[from] StorageError),

    #[error("background task failed: {0}")]
    Task(String),
}
