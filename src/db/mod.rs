//! SQLite storage: chunk rows, an FTS5 mirror for lexical search and a
//! sqlite-vec table for embeddings, plus per-file checkpoints.
use rusqlite::{Connection, OptionalExtension, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, Once};
use tracing::info;

use crate::chunker::Chunk;

pub mod buffer_pool;
pub mod documents;
pub mod file_hashes;
pub mod models;
pub mod search;
pub mod storage;

pub use buffer_pool::{VectorBufferPool, decode_vector};
pub use models::{ChunkWithEmbedding, IndexStats, ListOptions, SearchOptions, SearchResult};
pub use storage::{LexicalSearcher, Storage, StorageError};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    file_path TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    signature TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    language TEXT NOT NULL,
    domain TEXT,
    indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);
CREATE INDEX IF NOT EXISTS idx_chunks_kind ON chunks(kind);
CREATE INDEX IF NOT EXISTS idx_chunks_language ON chunks(language);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    name,
    content,
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS file_hashes (
    file_path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    indexed_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// [`Storage`] backed by one SQLite connection.
///
/// Every chunk mutation writes the `chunks` row, its `chunks_fts` mirror and
/// its `vec_chunks` vector inside a single transaction.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    dimensions: usize,
    buffers: VectorBufferPool,
}

impl SqliteStorage {
    /// Open (or create) a database at `path` for `dimensions`-wide vectors.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        // Register sqlite-vec extension globally
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        Self::init(conn, dimensions)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory(dimensions: usize) -> Result<Self, StorageError> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimensions)
    }

    fn init(conn: Connection, dimensions: usize) -> Result<Self, StorageError> {
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored.and_then(|v| v.parse::<usize>().ok()) {
            Some(existing) if existing != dimensions => {
                return Err(StorageError::DimensionMismatch {
                    expected: existing,
                    actual: dimensions,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('dimensions', ?)",
                    params![dimensions.to_string()],
                )?;
            }
        }

        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_chunks USING vec0(embedding FLOAT[{dimensions}]);"
        ))?;

        info!("Database initialized successfully");
        Ok(Self {
            conn: Mutex::new(conn),
            dimensions,
            buffers: VectorBufferPool::default(),
        })
    }

    /// Width of the stored vectors.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub(crate) fn check_dimensions(&self, embedding: &[f32]) -> Result<(), StorageError> {
        if embedding.len() != self.dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn create(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
        self.create_chunk(chunk, embedding)
    }

    fn create_batch(&self, items: &[ChunkWithEmbedding]) -> Result<(), StorageError> {
        self.create_chunks(items)
    }

    fn read(&self, id: &str) -> Result<Option<Chunk>, StorageError> {
        self.read_chunk(id)
    }

    fn update(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
        self.update_chunk(chunk, embedding)
    }

    fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.delete_chunk(id)
    }

    fn delete_by_file_path(&self, file_path: &str) -> Result<usize, StorageError> {
        self.delete_chunks_by_file_path(file_path)
    }

    fn list(&self, opts: &ListOptions) -> Result<Vec<Chunk>, StorageError> {
        self.list_chunks(opts)
    }

    fn list_file_paths(&self) -> Result<Vec<String>, StorageError> {
        SqliteStorage::list_file_paths(self)
    }

    fn search(
        &self,
        query: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, StorageError> {
        self.search_similar(query, opts)
    }

    fn stats(&self) -> Result<IndexStats, StorageError> {
        SqliteStorage::stats(self)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.clear_all()
    }

    fn get_file_hash(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        SqliteStorage::get_file_hash(self, file_path)
    }

    fn set_file_hash(&self, file_path: &str, hash: &str) -> Result<(), StorageError> {
        SqliteStorage::set_file_hash(self, file_path, hash)
    }

    fn delete_file_hash(&self, file_path: &str) -> Result<(), StorageError> {
        SqliteStorage::delete_file_hash(self, file_path)
    }
}

impl LexicalSearcher for SqliteStorage {
    fn lexical_search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, StorageError> {
        self.search_lexical(query, opts)
    }
}
