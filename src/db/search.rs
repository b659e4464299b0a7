use rusqlite::ToSql;
use rusqlite::types::Value;

use super::documents::{CHUNK_COLUMNS, map_chunk_row};
use super::models::{SearchOptions, SearchResult};
use super::{SqliteStorage, StorageError};

/// Appends the `kind`/`language`/`path_prefix` filters of `opts`.
fn push_filters(opts: &SearchOptions, where_clauses: &mut Vec<String>, params: &mut Vec<Value>) {
    if let Some(kind) = opts.kind {
        where_clauses.push("c.kind = ?".to_string());
        params.push(Value::Text(kind.as_str().to_string()));
    }
    if let Some(language) = &opts.language {
        where_clauses.push("c.language = ?".to_string());
        params.push(Value::Text(language.clone()));
    }
    if let Some(prefix) = &opts.path_prefix {
        // substr avoids escaping LIKE wildcards in real paths
        where_clauses.push("substr(c.file_path, 1, ?) = ?".to_string());
        params.push(Value::Integer(prefix.chars().count() as i64));
        params.push(Value::Text(prefix.clone()));
    }
}

/// Builds an FTS5 query matching any word of `query`. Each term is quoted so
/// FTS5 operators in user input are taken literally.
pub(crate) fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn run_query(
    storage: &SqliteStorage,
    query: &str,
    params: &[&dyn ToSql],
    threshold: Option<f64>,
    to_score: fn(f64) -> f64,
) -> Result<Vec<SearchResult>, StorageError> {
    let conn = storage.lock()?;
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map(params, |row| {
        let chunk = map_chunk_row(row)?;
        let raw: f64 = row.get(10)?;
        Ok(SearchResult {
            chunk,
            score: to_score(raw),
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        let result = row?;
        if threshold.is_some_and(|t| result.score < t) {
            continue;
        }
        results.push(result);
    }
    Ok(results)
}

impl SqliteStorage {
    /// Vector similarity search using cosine distance.
    pub fn search_similar(
        &self,
        query_vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, StorageError> {
        self.check_dimensions(query_vector)?;
        if opts.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut query = format!(
            "SELECT {CHUNK_COLUMNS}, vec_distance_cosine(v.embedding, ?) AS distance \
             FROM vec_chunks v JOIN chunks c ON v.rowid = c.seq"
        );
        let mut params: Vec<Value> = Vec::new();
        let mut where_clauses = Vec::new();
        push_filters(opts, &mut where_clauses, &mut params);

        if !where_clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&where_clauses.join(" AND "));
        }
        query.push_str(" ORDER BY distance ASC, c.seq ASC LIMIT ?");
        params.push(Value::Integer(opts.top_k as i64));

        // The pooled blob is bound in place and goes back to the pool on return
        let blob = self.buffers.encode(query_vector);
        let vector: &[u8] = &blob;
        let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(params.len() + 1);
        bound.push(&vector);
        bound.extend(params.iter().map(|p| p as &dyn ToSql));

        run_query(self, &query, &bound, opts.threshold, |distance| {
            1.0 - (distance / 2.0)
        })
    }

    /// Keyword search over chunk names and content, ranked by BM25.
    pub fn search_lexical(
        &self,
        text: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, StorageError> {
        let Some(matcher) = fts_query(text) else {
            return Ok(Vec::new());
        };
        if opts.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut query = format!(
            "SELECT {CHUNK_COLUMNS}, bm25(chunks_fts) AS rank \
             FROM chunks_fts JOIN chunks c ON c.seq = chunks_fts.rowid"
        );
        let mut params: Vec<Value> = vec![Value::Text(matcher)];
        let mut where_clauses = vec!["chunks_fts MATCH ?".to_string()];
        push_filters(opts, &mut where_clauses, &mut params);

        query.push_str(" WHERE ");
        query.push_str(&where_clauses.join(" AND "));
        query.push_str(" ORDER BY rank ASC, c.seq ASC LIMIT ?");
        params.push(Value::Integer(opts.top_k as i64));

        let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        // bm25() is lower-is-better
        run_query(self, &query, &bound, opts.threshold, |rank| -rank)
    }
}
