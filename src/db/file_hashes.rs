//! Per-file content checkpoints and index statistics.
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::models::IndexStats;
use super::{SqliteStorage, StorageError};

impl SqliteStorage {
    pub fn get_file_hash(&self, file_path: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        let hash = conn
            .query_row(
                "SELECT content_hash FROM file_hashes WHERE file_path = ?",
                params![file_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn set_file_hash(&self, file_path: &str, hash: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO file_hashes (file_path, content_hash, indexed_at) VALUES (?, ?, ?)
             ON CONFLICT(file_path) DO UPDATE SET content_hash = excluded.content_hash, indexed_at = excluded.indexed_at",
            params![file_path, hash, Utc::now()],
        )?;
        Ok(())
    }

    pub fn delete_file_hash(&self, file_path: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM file_hashes WHERE file_path = ?",
            params![file_path],
        )?;
        Ok(())
    }

    /// Paths holding chunks or a checkpoint, sorted.
    pub fn list_file_paths(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_path FROM chunks UNION SELECT file_path FROM file_hashes ORDER BY file_path",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    pub fn stats(&self) -> Result<IndexStats, StorageError> {
        let conn = self.lock()?;
        let chunks_total: i64 = conn.query_row("SELECT count(*) FROM chunks", [], |row| row.get(0))?;
        let files_indexed: i64 = conn.query_row(
            "SELECT count(*) FROM (SELECT file_path FROM chunks UNION SELECT file_path FROM file_hashes)",
            [],
            |row| row.get(0),
        )?;
        let last_updated: Option<DateTime<Utc>> = conn.query_row(
            "SELECT MAX(indexed_at) FROM file_hashes",
            [],
            |row| row.get(0),
        )?;

        Ok(IndexStats {
            files_indexed: files_indexed as usize,
            chunks_total: chunks_total as usize,
            embedding_model: None,
            last_updated,
        })
    }

    /// Removes every chunk, mirror row and checkpoint. The stored vector
    /// width is kept.
    pub fn clear_all(&self) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM chunks_fts;
             DELETE FROM vec_chunks;
             DELETE FROM chunks;
             DELETE FROM file_hashes;",
        )?;
        tx.commit()?;
        Ok(())
    }
}
