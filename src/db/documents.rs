//! Chunk CRUD with the full-text and vector mirrors kept in step.
use rusqlite::types::{Type, Value};
use rusqlite::{OptionalExtension, Row, Transaction, params};

use super::models::{ChunkWithEmbedding, ListOptions};
use super::{SqliteStorage, StorageError, decode_vector};
use crate::chunker::{Chunk, ChunkKind};

pub(crate) const CHUNK_COLUMNS: &str = "c.id, c.file_path, c.kind, c.name, c.signature, c.content, \
     c.start_line, c.end_line, c.language, c.domain";

/// Maps a row selected with [`CHUNK_COLUMNS`] (in that order, from index 0).
pub(crate) fn map_chunk_row(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let kind: String = row.get(2)?;
    let kind = kind
        .parse::<ChunkKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    Ok(Chunk {
        id: row.get(0)?,
        file_path: row.get(1)?,
        kind,
        name: row.get(3)?,
        signature: row.get(4)?,
        content: row.get(5)?,
        start_line: row.get::<_, i64>(6)? as usize,
        end_line: row.get::<_, i64>(7)? as usize,
        language: row.get(8)?,
        domain: row.get(9)?,
    })
}

/// Deletes the chunk row with `id` and its mirrors. Returns whether it existed.
fn remove_by_id(tx: &Transaction<'_>, id: &str) -> rusqlite::Result<bool> {
    let seq: Option<i64> = tx
        .query_row("SELECT seq FROM chunks WHERE id = ?", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    let Some(seq) = seq else {
        return Ok(false);
    };
    tx.execute("DELETE FROM chunks_fts WHERE rowid = ?", params![seq])?;
    tx.execute("DELETE FROM vec_chunks WHERE rowid = ?", params![seq])?;
    tx.execute("DELETE FROM chunks WHERE seq = ?", params![seq])?;
    Ok(true)
}

impl SqliteStorage {
    /// Writes the chunk row, its FTS row and its vector. A row already holding
    /// the same ID is replaced.
    fn insert_chunk(
        &self,
        tx: &Transaction<'_>,
        chunk: &Chunk,
        embedding: &[f32],
    ) -> Result<(), StorageError> {
        remove_by_id(tx, &chunk.id)?;
        tx.execute(
            "INSERT INTO chunks (id, file_path, kind, name, signature, content, start_line, end_line, language, domain) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                chunk.id,
                chunk.file_path,
                chunk.kind.as_str(),
                chunk.name,
                chunk.signature,
                chunk.content,
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.language,
                chunk.domain,
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO chunks_fts (rowid, name, content) VALUES (?, ?, ?)",
            params![seq, chunk.name, chunk.content],
        )?;

        let blob = self.buffers.encode(embedding);
        tx.execute(
            "INSERT INTO vec_chunks (rowid, embedding) VALUES (?, ?)",
            params![seq, &blob[..]],
        )?;
        Ok(())
    }

    pub fn create_chunk(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
        self.check_dimensions(embedding)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        self.insert_chunk(&tx, chunk, embedding)?;
        tx.commit()?;
        Ok(())
    }

    /// Inserts all items in one transaction; nothing is written if any fails.
    pub fn create_chunks(&self, items: &[ChunkWithEmbedding]) -> Result<(), StorageError> {
        for item in items {
            self.check_dimensions(&item.embedding)?;
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for item in items {
            self.insert_chunk(&tx, &item.chunk, &item.embedding)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn read_chunk(&self, id: &str) -> Result<Option<Chunk>, StorageError> {
        let conn = self.lock()?;
        let chunk = conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.id = ?"),
                params![id],
                map_chunk_row,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Replaces an existing chunk and all of its mirrors.
    pub fn update_chunk(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
        self.check_dimensions(embedding)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT seq FROM chunks WHERE id = ?",
                params![chunk.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StorageError::NotFound(chunk.id.clone()));
        }
        self.insert_chunk(&tx, chunk, embedding)?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_chunk(&self, id: &str) -> Result<bool, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = remove_by_id(&tx, id)?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn delete_chunks_by_file_path(&self, file_path: &str) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        // Virtual tables are cleared by subquery before the parent rows go
        tx.execute(
            "DELETE FROM chunks_fts WHERE rowid IN (SELECT seq FROM chunks WHERE file_path = ?)",
            params![file_path],
        )?;
        tx.execute(
            "DELETE FROM vec_chunks WHERE rowid IN (SELECT seq FROM chunks WHERE file_path = ?)",
            params![file_path],
        )?;
        let removed = tx.execute("DELETE FROM chunks WHERE file_path = ?", params![file_path])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn list_chunks(&self, opts: &ListOptions) -> Result<Vec<Chunk>, StorageError> {
        let mut query = format!("SELECT {CHUNK_COLUMNS} FROM chunks c");
        let mut where_clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(path) = &opts.file_path {
            where_clauses.push("c.file_path = ?");
            params.push(Value::Text(path.clone()));
        }
        if let Some(kind) = opts.kind {
            where_clauses.push("c.kind = ?");
            params.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(language) = &opts.language {
            where_clauses.push("c.language = ?");
            params.push(Value::Text(language.clone()));
        }
        if !where_clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&where_clauses.join(" AND "));
        }
        query.push_str(" ORDER BY c.file_path, c.start_line, c.name LIMIT ? OFFSET ?");
        let limit = if opts.limit == 0 { -1 } else { opts.limit as i64 };
        params.push(Value::Integer(limit));
        params.push(Value::Integer(opts.offset as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), map_chunk_row)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// The stored vector for chunk `id`.
    pub fn embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StorageError> {
        let conn = self.lock()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT v.embedding FROM vec_chunks v JOIN chunks c ON v.rowid = c.seq WHERE c.id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| decode_vector(&b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, name: &str, line: usize) -> Chunk {
        Chunk::new(
            path,
            ChunkKind::Function,
            name,
            format!("fn {name}() {{}}"),
            line,
            line + 2,
            "rust",
        )
    }

    fn count(db: &SqliteStorage, table: &str) -> i64 {
        db.lock()
            .unwrap()
            .query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_documents_crud() {
        let db = SqliteStorage::open_in_memory(4).unwrap();
        let a = chunk("src/a.rs", "alpha", 1);

        db.create_chunk(&a, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let read = db.read_chunk(&a.id).unwrap().unwrap();
        assert_eq!(read, a);

        let mut changed = a.clone();
        changed.content = "fn alpha() { 42 }".to_string();
        db.update_chunk(&changed, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(db.read_chunk(&a.id).unwrap().unwrap().content, "fn alpha() { 42 }");
        assert_eq!(db.embedding(&a.id).unwrap().unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(count(&db, "chunks_fts"), 1);
        assert_eq!(count(&db, "vec_chunks"), 1);

        assert!(db.delete_chunk(&a.id).unwrap());
        assert!(!db.delete_chunk(&a.id).unwrap());
        assert!(db.read_chunk(&a.id).unwrap().is_none());
        assert_eq!(count(&db, "chunks_fts"), 0);
        assert_eq!(count(&db, "vec_chunks"), 0);
    }

    #[test]
    fn test_update_missing_chunk() {
        let db = SqliteStorage::open_in_memory(4).unwrap();
        let err = db
            .update_chunk(&chunk("a.rs", "ghost", 1), &[0.0; 4])
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let db = SqliteStorage::open_in_memory(4).unwrap();
        let items = vec![
            ChunkWithEmbedding {
                chunk: chunk("a.rs", "one", 1),
                embedding: vec![1.0; 4],
            },
            ChunkWithEmbedding {
                chunk: chunk("a.rs", "two", 5),
                embedding: vec![1.0; 3],
            },
        ];
        let err = db.create_chunks(&items).unwrap_err();
        assert!(matches!(
            err,
            StorageError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(count(&db, "chunks"), 0);
    }

    #[test]
    fn test_delete_by_file_path_clears_mirrors() {
        let db = SqliteStorage::open_in_memory(4).unwrap();
        let items: Vec<ChunkWithEmbedding> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| ChunkWithEmbedding {
                chunk: chunk("src/x.rs", name, i * 10 + 1),
                embedding: vec![0.5; 4],
            })
            .chain(std::iter::once(ChunkWithEmbedding {
                chunk: chunk("src/y.rs", "keep", 1),
                embedding: vec![0.5; 4],
            }))
            .collect();
        db.create_chunks(&items).unwrap();

        assert_eq!(db.delete_chunks_by_file_path("src/x.rs").unwrap(), 3);
        assert_eq!(count(&db, "chunks"), 1);
        assert_eq!(count(&db, "chunks_fts"), 1);
        assert_eq!(count(&db, "vec_chunks"), 1);
        assert_eq!(db.delete_chunks_by_file_path("src/x.rs").unwrap(), 0);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let db = SqliteStorage::open_in_memory(4).unwrap();
        let mut doc = Chunk::new("README.md", ChunkKind::File, "README > Intro", "hi", 1, 3, "markdown");
        doc.domain = Some("docs".to_string());
        db.create_chunk(&doc, &[0.1; 4]).unwrap();
        for i in 0..3 {
            db.create_chunk(&chunk("src/lib.rs", &format!("f{i}"), i * 5 + 1), &[0.2; 4])
                .unwrap();
        }

        let all = db.list_chunks(&ListOptions::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].domain.as_deref(), Some("docs"));

        let functions = db
            .list_chunks(&ListOptions {
                kind: Some(ChunkKind::Function),
                ..ListOptions::default()
            })
            .unwrap();
        assert_eq!(functions.len(), 3);

        let page = db
            .list_chunks(&ListOptions {
                file_path: Some("src/lib.rs".to_string()),
                limit: 2,
                offset: 1,
                ..ListOptions::default()
            })
            .unwrap();
        let names: Vec<&str> = page.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["f1", "f2"]);
    }
}
