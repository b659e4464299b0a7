use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ContentHashGate, FileDiscovery, FileError, IndexError, IndexOptions, IndexResult,
    ProgressEvent, UpdateOptions, UpdateResult, UploadProgressEvent, content_hash,
};
use crate::chunker::{Chunk, ChunkerRegistry};
use crate::db::{ChunkWithEmbedding, IndexStats, Storage, StorageError};
use crate::embedder::{Embedder, EmbedderError};

/// Runs a synchronous chunker, embedder or storage call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| e.to_string())
}

/// Storage key for a discovered file.
fn path_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn pair(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Vec<ChunkWithEmbedding> {
    chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, embedding)| ChunkWithEmbedding { chunk, embedding })
        .collect()
}

async fn write_batch(
    storage: Arc<dyn Storage>,
    items: Vec<ChunkWithEmbedding>,
) -> Result<(), StorageError> {
    blocking(move || storage.create_batch(&items))
        .await
        .map_err(StorageError::Backend)?
}

/// Writes `items` in sub-batches of `batch_size` (zero: one call), with up to
/// `parallel` writes in flight. After the first failure no new write starts;
/// writes already running finish, then the first error is returned.
async fn store_items(
    storage: &Arc<dyn Storage>,
    mut items: Vec<ChunkWithEmbedding>,
    batch_size: usize,
    parallel: usize,
) -> Result<(), StorageError> {
    if items.is_empty() {
        return Ok(());
    }
    if batch_size == 0 || items.len() <= batch_size {
        return write_batch(Arc::clone(storage), items).await;
    }

    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    while !items.is_empty() {
        let rest = items.split_off(batch_size.min(items.len()));
        batches.push(items);
        items = rest;
    }

    if parallel <= 1 {
        for batch in batches {
            write_batch(Arc::clone(storage), batch).await?;
        }
        return Ok(());
    }

    let semaphore = Arc::new(Semaphore::new(parallel));
    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    for batch in batches {
        let storage = Arc::clone(storage);
        let semaphore = Arc::clone(&semaphore);
        let failed = Arc::clone(&failed);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            if failed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let outcome = write_batch(storage, batch).await;
            if outcome.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            outcome
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| StorageError::Backend(e.to_string()))
            .and_then(|r| r);
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A chunked file waiting for its cross-file batch to be committed.
struct PendingFile {
    key: String,
    hash: String,
    chunks: Vec<Chunk>,
}

/// Builds and maintains the index for a source tree.
///
/// Files are committed in write-after-data order: a file's chunks are
/// durably stored before its content hash is checkpointed, so an interrupted
/// run only ever leaves files that are safely re-processed next time.
pub struct IndexManager {
    storage: Arc<dyn Storage>,
    embedder: Arc<dyn Embedder>,
    registry: ChunkerRegistry,
    gate: ContentHashGate,
    cancel: CancellationToken,
}

impl IndexManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        embedder: Arc<dyn Embedder>,
        registry: ChunkerRegistry,
    ) -> Self {
        let gate = ContentHashGate::new(Arc::clone(&storage));
        Self {
            storage,
            embedder,
            registry,
            gate,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop runs when `token` is cancelled. It is checked between files and
    /// between batches, never in the middle of one.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn check_cancelled(&self) -> Result<(), IndexError> {
        if self.cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        Ok(())
    }

    async fn discover(
        &self,
        discovery: FileDiscovery,
        root: &Path,
    ) -> Result<Vec<PathBuf>, IndexError> {
        let registry = self.registry.clone();
        let root = root.to_path_buf();
        blocking(move || discovery.discover(&root, &registry))
            .await
            .map_err(IndexError::Task)?
    }

    /// Build or extend the index for `root`.
    ///
    /// With `force` the index is cleared first; otherwise files whose
    /// checkpoint matches their content are counted unchanged and skipped.
    pub async fn index(&self, root: &Path, opts: &IndexOptions) -> Result<IndexResult, IndexError> {
        let discovery = FileDiscovery::new(&opts.includes, &opts.excludes, opts.exclude_tests)?;
        let files = self.discover(discovery, root).await?;
        info!(root = %root.display(), files = files.len(), "Indexing");

        if opts.force {
            let storage = Arc::clone(&self.storage);
            blocking(move || storage.clear())
                .await
                .map_err(IndexError::Task)??;
            info!("Cleared existing index");
        }

        let mut result = IndexResult::default();
        if opts.embed_batch_size > 0 {
            self.index_cross_file(&files, opts, &mut result).await?;
        } else {
            self.index_per_file(&files, opts, &mut result).await?;
        }

        info!(
            processed = result.files_processed,
            unchanged = result.files_unchanged,
            failed = result.files_skipped,
            chunks = result.chunks_created,
            "Indexing finished"
        );
        Ok(result)
    }

    async fn index_per_file(
        &self,
        files: &[PathBuf],
        opts: &IndexOptions,
        result: &mut IndexResult,
    ) -> Result<(), IndexError> {
        let total = files.len();
        for (i, path) in files.iter().enumerate() {
            self.check_cancelled()?;
            let key = path_key(path);

            let mut skipped = false;
            match tokio::fs::read(path).await {
                Err(e) => Self::record_failure(result, &key, FileError::Read(e)),
                Ok(content) => {
                    let hash = content_hash(&content);
                    if !opts.force && !self.gate.needs_index(&key, &hash) {
                        result.files_unchanged += 1;
                        skipped = true;
                    } else {
                        match self
                            .process_file(&key, content, &hash, opts.batch_size, opts.parallel, opts.domain.clone())
                            .await
                        {
                            Ok(created) => {
                                result.files_processed += 1;
                                result.chunks_created += created;
                            }
                            Err(e) => Self::record_failure(result, &key, e),
                        }
                    }
                }
            }

            if let Some(on_progress) = &opts.on_progress {
                on_progress(&ProgressEvent {
                    current: i + 1,
                    total,
                    file_path: key,
                    chunks_total: result.chunks_created,
                    skipped,
                });
            }
        }
        Ok(())
    }

    fn record_failure(result: &mut IndexResult, key: &str, error: FileError) {
        warn!(file = %key, error = %error, "Skipping file");
        result.errors.push(format!("{key}: {error}"));
        result.files_skipped += 1;
    }

    /// Chunk one file's bytes, stamping `domain` on every chunk.
    async fn chunk_file(
        &self,
        key: &str,
        content: Vec<u8>,
        domain: Option<String>,
    ) -> Result<Vec<Chunk>, FileError> {
        let chunker = self.registry.resolve(key).ok_or(FileError::NoChunker)?;
        let path = key.to_string();
        let mut chunks = blocking(move || chunker.chunk(&path, &content))
            .await
            .map_err(FileError::Task)??;
        if chunks.is_empty() {
            return Err(FileError::Empty);
        }
        if let Some(domain) = domain {
            for chunk in &mut chunks {
                chunk.domain = Some(domain.clone());
            }
        }
        Ok(chunks)
    }

    /// One embedding call for all of `chunks`, in order.
    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
    ) -> Result<Result<Vec<Vec<f32>>, EmbedderError>, String> {
        let texts: Vec<String> = chunks.iter().map(Chunk::embedding_text).collect();
        let embedder = Arc::clone(&self.embedder);
        blocking(move || {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            embedder.embed_batch(&refs)
        })
        .await
    }

    /// Chunk, embed and store one file, then checkpoint it. Returns the
    /// number of chunks written.
    async fn process_file(
        &self,
        key: &str,
        content: Vec<u8>,
        hash: &str,
        batch_size: usize,
        parallel: usize,
        domain: Option<String>,
    ) -> Result<usize, FileError> {
        let chunks = self.chunk_file(key, content, domain).await?;
        let vectors = self.embed_chunks(&chunks).await.map_err(FileError::Task)??;
        if vectors.len() != chunks.len() {
            return Err(FileError::EmbeddingCount {
                expected: chunks.len(),
                actual: vectors.len(),
            });
        }
        let items = pair(chunks, vectors);
        let created = items.len();

        // Stale rows from an interrupted run would collide with fresh IDs
        let storage = Arc::clone(&self.storage);
        let path = key.to_string();
        blocking(move || storage.delete_by_file_path(&path))
            .await
            .map_err(FileError::Task)??;

        store_items(&self.storage, items, batch_size, parallel).await?;
        self.checkpoint(key, hash);
        debug!(file = %key, chunks = created, "Indexed file");
        Ok(created)
    }

    /// Record a file as indexed. Failures only cost a re-process next run.
    fn checkpoint(&self, key: &str, hash: &str) {
        if let Err(e) = self.storage.set_file_hash(key, hash) {
            warn!(file = %key, error = %e, "Failed to write checkpoint");
        }
    }

    async fn index_cross_file(
        &self,
        files: &[PathBuf],
        opts: &IndexOptions,
        result: &mut IndexResult,
    ) -> Result<(), IndexError> {
        let total = files.len();
        let target = opts.embed_batch_size;

        // Group changed files into batches of roughly `target` chunks. A file
        // never straddles two batches.
        let mut batches: Vec<Vec<PendingFile>> = Vec::new();
        let mut current: Vec<PendingFile> = Vec::new();
        let mut current_chunks = 0;
        let mut pending_chunks = 0;

        for (i, path) in files.iter().enumerate() {
            self.check_cancelled()?;
            let key = path_key(path);

            let content = match tokio::fs::read(path).await {
                Ok(content) => content,
                Err(e) => {
                    Self::record_failure(result, &key, FileError::Read(e));
                    continue;
                }
            };
            let hash = content_hash(&content);

            if !opts.force && !self.gate.needs_index(&key, &hash) {
                result.files_unchanged += 1;
                if let Some(on_progress) = &opts.on_progress {
                    on_progress(&ProgressEvent {
                        current: i + 1,
                        total,
                        file_path: key,
                        chunks_total: result.chunks_created,
                        skipped: true,
                    });
                }
                continue;
            }

            let chunks = match self.chunk_file(&key, content, opts.domain.clone()).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    Self::record_failure(result, &key, e);
                    continue;
                }
            };
            current_chunks += chunks.len();
            pending_chunks += chunks.len();
            current.push(PendingFile {
                key: key.clone(),
                hash,
                chunks,
            });

            if let Some(on_progress) = &opts.on_progress {
                on_progress(&ProgressEvent {
                    current: i + 1,
                    total,
                    file_path: key,
                    chunks_total: result.chunks_created + pending_chunks,
                    skipped: false,
                });
            }

            if current_chunks >= target {
                batches.push(std::mem::take(&mut current));
                current_chunks = 0;
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        if batches.is_empty() {
            return Ok(());
        }

        let total_batches = batches.len();
        let started = Instant::now();
        for (idx, batch) in batches.into_iter().enumerate() {
            self.check_cancelled()?;
            let number = idx + 1;
            let committed = self.commit_batch(number, batch, opts, result).await?;

            let elapsed = started.elapsed();
            let remaining = (total_batches - number) as u32;
            let eta = elapsed.checked_div(number as u32).unwrap_or(Duration::ZERO) * remaining;
            debug!(batch = number, chunks = committed, eta_secs = eta.as_secs(), "Committed batch");

            if let Some(on_upload) = &opts.on_upload_progress {
                on_upload(&UploadProgressEvent {
                    phase: "indexing",
                    current: number,
                    total: total_batches,
                    chunks_uploaded: result.chunks_created,
                    chunks_total: pending_chunks,
                    batch_size: committed,
                    elapsed,
                    eta,
                });
            }
        }
        Ok(())
    }

    /// Embed once, store once, then checkpoint every file in the batch.
    /// Returns the number of chunks committed.
    async fn commit_batch(
        &self,
        number: usize,
        batch: Vec<PendingFile>,
        opts: &IndexOptions,
        result: &mut IndexResult,
    ) -> Result<usize, IndexError> {
        let checkpoints: Vec<(String, String)> = batch
            .iter()
            .map(|f| (f.key.clone(), f.hash.clone()))
            .collect();
        let chunks: Vec<Chunk> = batch.into_iter().flat_map(|f| f.chunks).collect();

        let vectors = self
            .embed_chunks(&chunks)
            .await
            .map_err(IndexError::Task)?
            .map_err(|source| IndexError::Embedding {
                batch: number,
                source,
            })?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::EmbeddingCount {
                batch: number,
                expected: chunks.len(),
                actual: vectors.len(),
            });
        }
        let items = pair(chunks, vectors);
        let committed = items.len();

        let storage = Arc::clone(&self.storage);
        let paths: Vec<String> = checkpoints.iter().map(|(key, _)| key.clone()).collect();
        blocking(move || {
            for path in &paths {
                storage.delete_by_file_path(path)?;
            }
            Ok::<_, StorageError>(())
        })
        .await
        .map_err(IndexError::Task)?
        .map_err(|source| IndexError::Store {
            batch: number,
            source,
        })?;

        store_items(&self.storage, items, opts.batch_size, opts.parallel)
            .await
            .map_err(|source| IndexError::Store {
                batch: number,
                source,
            })?;

        for (key, hash) in &checkpoints {
            self.checkpoint(key, hash);
        }
        result.files_processed += checkpoints.len();
        result.chunks_created += committed;
        Ok(committed)
    }

    /// Re-index changed files under `root` and drop stored files that are no
    /// longer found there.
    pub async fn update(
        &self,
        root: &Path,
        opts: &UpdateOptions,
    ) -> Result<UpdateResult, IndexError> {
        let discovery = FileDiscovery::new(&opts.includes, &opts.excludes, opts.exclude_tests)?;
        let files = self.discover(discovery, root).await?;

        let storage = Arc::clone(&self.storage);
        let stored = blocking(move || storage.list_file_paths())
            .await
            .map_err(IndexError::Task)??;

        let mut result = UpdateResult::default();
        let mut seen = HashSet::with_capacity(files.len());

        for path in &files {
            self.check_cancelled()?;
            let key = path_key(path);
            seen.insert(key.clone());

            let content = match tokio::fs::read(path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %key, error = %e, "Skipping file");
                    result.errors.push(format!("{key}: {}", FileError::Read(e)));
                    continue;
                }
            };
            let hash = content_hash(&content);
            if !self.gate.needs_index(&key, &hash) {
                continue;
            }

            // Old chunks go first so shifted boundaries leave nothing behind
            match self.remove_file(&key).await {
                Ok(removed) => result.chunks_removed += removed,
                Err(e) => {
                    warn!(file = %key, error = %e, "Failed to remove old chunks");
                    result.errors.push(format!("{key}: {e}"));
                    continue;
                }
            }

            match self
                .process_file(&key, content, &hash, opts.batch_size, opts.parallel, opts.domain.clone())
                .await
            {
                Ok(created) => {
                    result.files_updated += 1;
                    result.chunks_created += created;
                }
                Err(e) => {
                    warn!(file = %key, error = %e, "Skipping file");
                    result.errors.push(format!("{key}: {e}"));
                }
            }
        }

        for key in stored {
            if seen.contains(&key) || !Path::new(&key).starts_with(root) {
                continue;
            }
            self.check_cancelled()?;
            match self.remove_file(&key).await {
                Ok(removed) => {
                    debug!(file = %key, chunks = removed, "Removed deleted file");
                    result.files_removed += 1;
                    result.chunks_removed += removed;
                }
                Err(e) => result.errors.push(format!("{key}: {e}")),
            }
        }

        info!(
            updated = result.files_updated,
            removed = result.files_removed,
            chunks_created = result.chunks_created,
            chunks_removed = result.chunks_removed,
            "Update finished"
        );
        Ok(result)
    }

    /// Drop a file's chunks and checkpoint. Returns the chunks removed.
    async fn remove_file(&self, key: &str) -> Result<usize, IndexError> {
        let storage = Arc::clone(&self.storage);
        let path = key.to_string();
        let removed = blocking(move || {
            let removed = storage.delete_by_file_path(&path)?;
            storage.delete_file_hash(&path)?;
            Ok::<_, StorageError>(removed)
        })
        .await
        .map_err(IndexError::Task)??;
        Ok(removed)
    }

    /// Storage statistics plus the embedding model in use.
    pub async fn status(&self) -> Result<IndexStats, IndexError> {
        let storage = Arc::clone(&self.storage);
        let mut stats = blocking(move || storage.stats())
            .await
            .map_err(IndexError::Task)??;
        stats.embedding_model = Some(self.embedder.model().to_string());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::db::{ListOptions, SearchOptions, SearchResult, SqliteStorage};
    use crate::embedder::MockEmbedder;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const DIMS: usize = 16;

    fn registry() -> ChunkerRegistry {
        ChunkerRegistry::with_defaults(&ChunkingConfig::default()).unwrap()
    }

    fn setup(embedder: MockEmbedder) -> (Arc<SqliteStorage>, Arc<MockEmbedder>, IndexManager) {
        let storage = Arc::new(SqliteStorage::open_in_memory(DIMS).unwrap());
        let embedder = Arc::new(embedder);
        let manager = IndexManager::new(storage.clone(), embedder.clone(), registry());
        (storage, embedder, manager)
    }

    /// Three markdown files holding 2, 1 and 1 sections.
    fn write_tree(root: &Path) {
        fs::write(root.join("a.md"), "# Alpha\n\nfirst\n\n## Beta\n\nsecond\n").unwrap();
        fs::write(root.join("b.md"), "# Gamma\n\nthird\n").unwrap();
        fs::write(root.join("c.md"), "# Delta\n\nfourth\n").unwrap();
    }

    fn key(root: &Path, name: &str) -> String {
        path_key(&root.join(name))
    }

    fn chunks_of(storage: &SqliteStorage, file: &str) -> Vec<Chunk> {
        storage
            .list_chunks(&ListOptions {
                file_path: Some(file.to_string()),
                ..ListOptions::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_is_resumable() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS));

        let first = manager.index(dir.path(), &IndexOptions::default()).await.unwrap();
        assert_eq!(first.files_processed, 3);
        assert_eq!(first.chunks_created, 4);
        assert_eq!(first.files_unchanged, 0);
        assert!(first.errors.is_empty());

        let second = manager.index(dir.path(), &IndexOptions::default()).await.unwrap();
        assert_eq!(second.files_processed, 0);
        assert_eq!(second.files_unchanged, first.files_processed);
        assert_eq!(second.chunks_created, 0);

        let forced = manager
            .index(
                dir.path(),
                &IndexOptions {
                    force: true,
                    ..IndexOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(forced.files_processed, 3);
        assert_eq!(storage.stats().unwrap().chunks_total, 4);
    }

    #[tokio::test]
    async fn test_progress_events_flag_skipped_files() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        let (_, _, manager) = setup(MockEmbedder::new(DIMS));
        manager.index(dir.path(), &IndexOptions::default()).await.unwrap();

        fs::write(dir.path().join("b.md"), "# Gamma\n\nchanged\n").unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let opts = IndexOptions {
            on_progress: Some(Arc::new(move |e: &ProgressEvent| {
                sink.lock().unwrap().push(e.clone());
            })),
            ..IndexOptions::default()
        };
        let result = manager.index(dir.path(), &opts).await.unwrap();
        assert_eq!(result.files_processed, 1);
        assert_eq!(result.files_unchanged, 2);

        let events = events.lock().unwrap();
        let flags: Vec<(usize, bool)> = events.iter().map(|e| (e.current, e.skipped)).collect();
        assert_eq!(flags, vec![(1, true), (2, false), (3, true)]);
        assert!(events.iter().all(|e| e.total == 3));
    }

    #[tokio::test]
    async fn test_cross_file_batching() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        let (storage, embedder, manager) = setup(MockEmbedder::new(DIMS));

        let uploads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&uploads);
        let opts = IndexOptions {
            embed_batch_size: 2,
            on_upload_progress: Some(Arc::new(move |e: &UploadProgressEvent| {
                sink.lock().unwrap().push(e.clone());
            })),
            ..IndexOptions::default()
        };
        let result = manager.index(dir.path(), &opts).await.unwrap();
        assert_eq!(result.files_processed, 3);
        assert_eq!(result.chunks_created, 4);

        // a.md fills the first batch; b.md and c.md share the second
        assert_eq!(embedder.batch_calls(), 2);
        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].batch_size, 2);
        assert_eq!(uploads[1].chunks_uploaded, 4);
        assert_eq!(uploads[1].chunks_total, 4);
        assert_eq!(uploads[1].eta, Duration::ZERO);

        for name in ["a.md", "b.md", "c.md"] {
            assert!(storage.get_file_hash(&key(dir.path(), name)).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_cross_file_embedding_failure_aborts_and_resumes() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        fs::write(dir.path().join("b.md"), "# Gamma\n\nBOOM\n").unwrap();
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS).failing_on("BOOM"));

        let opts = IndexOptions {
            embed_batch_size: 1,
            ..IndexOptions::default()
        };
        let err = manager.index(dir.path(), &opts).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding { batch: 2, .. }));

        // The first batch stays committed
        assert!(storage.get_file_hash(&key(dir.path(), "a.md")).unwrap().is_some());
        assert!(storage.get_file_hash(&key(dir.path(), "b.md")).unwrap().is_none());
        assert!(storage.get_file_hash(&key(dir.path(), "c.md")).unwrap().is_none());

        let healthy = IndexManager::new(storage.clone(), Arc::new(MockEmbedder::new(DIMS)), registry());
        let resumed = healthy.index(dir.path(), &opts).await.unwrap();
        assert_eq!(resumed.files_unchanged, 1);
        assert_eq!(resumed.files_processed, 2);
        assert_eq!(storage.stats().unwrap().chunks_total, 4);
    }

    #[tokio::test]
    async fn test_per_file_failures_are_isolated() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        fs::write(dir.path().join("b.md"), "# Gamma\n\nBOOM\n").unwrap();
        fs::write(dir.path().join("empty.md"), "").unwrap();
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS).failing_on("BOOM"));

        let result = manager.index(dir.path(), &IndexOptions::default()).await.unwrap();
        assert_eq!(result.files_processed, 2);
        assert_eq!(result.files_skipped, 2);
        assert_eq!(result.errors.len(), 2);
        let b = key(dir.path(), "b.md");
        assert!(result.errors[0].starts_with(&b));
        assert!(result.errors[0].contains("embeddings"));
        assert!(result.errors[1].contains("no chunks produced"));
        assert!(storage.get_file_hash(&b).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parallel_sub_batches() {
        let dir = tempdir().unwrap();
        let doc: String = (0..10).map(|i| format!("# Section {i}\n\nbody {i}\n\n")).collect();
        fs::write(dir.path().join("big.md"), doc).unwrap();
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS));

        let opts = IndexOptions {
            batch_size: 3,
            parallel: 2,
            ..IndexOptions::default()
        };
        let result = manager.index(dir.path(), &opts).await.unwrap();
        assert_eq!(result.chunks_created, 10);
        assert_eq!(storage.stats().unwrap().chunks_total, 10);
    }

    /// Rejects any batch holding a chunk whose name contains "poison".
    struct PoisonedStorage {
        inner: SqliteStorage,
    }

    impl Storage for PoisonedStorage {
        fn create(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
            self.inner.create_chunk(chunk, embedding)
        }
        fn create_batch(&self, items: &[ChunkWithEmbedding]) -> Result<(), StorageError> {
            if items.iter().any(|i| i.chunk.name.contains("poison")) {
                return Err(StorageError::Backend("poisoned batch".to_string()));
            }
            self.inner.create_chunks(items)
        }
        fn read(&self, id: &str) -> Result<Option<Chunk>, StorageError> {
            self.inner.read_chunk(id)
        }
        fn update(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), StorageError> {
            self.inner.update_chunk(chunk, embedding)
        }
        fn delete(&self, id: &str) -> Result<bool, StorageError> {
            self.inner.delete_chunk(id)
        }
        fn delete_by_file_path(&self, file_path: &str) -> Result<usize, StorageError> {
            self.inner.delete_chunks_by_file_path(file_path)
        }
        fn list(&self, opts: &ListOptions) -> Result<Vec<Chunk>, StorageError> {
            self.inner.list_chunks(opts)
        }
        fn list_file_paths(&self) -> Result<Vec<String>, StorageError> {
            self.inner.list_file_paths()
        }
        fn search(
            &self,
            query: &[f32],
            opts: &SearchOptions,
        ) -> Result<Vec<SearchResult>, StorageError> {
            self.inner.search_similar(query, opts)
        }
        fn stats(&self) -> Result<IndexStats, StorageError> {
            self.inner.stats()
        }
        fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear_all()
        }
        fn get_file_hash(&self, file_path: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_file_hash(file_path)
        }
        fn set_file_hash(&self, file_path: &str, hash: &str) -> Result<(), StorageError> {
            self.inner.set_file_hash(file_path, hash)
        }
        fn delete_file_hash(&self, file_path: &str) -> Result<(), StorageError> {
            self.inner.delete_file_hash(file_path)
        }
    }

    #[tokio::test]
    async fn test_store_failure_skips_checkpoint() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        fs::write(
            dir.path().join("d.md"),
            "# One\n\nx\n\n# poison\n\ny\n\n# Three\n\nz\n",
        )
        .unwrap();
        let storage = Arc::new(PoisonedStorage {
            inner: SqliteStorage::open_in_memory(DIMS).unwrap(),
        });
        let manager = IndexManager::new(storage.clone(), Arc::new(MockEmbedder::new(DIMS)), registry());

        let opts = IndexOptions {
            batch_size: 1,
            parallel: 4,
            ..IndexOptions::default()
        };
        let result = manager.index(dir.path(), &opts).await.unwrap();
        assert_eq!(result.files_processed, 3);
        assert_eq!(result.files_skipped, 1);
        assert!(result.errors[0].contains("poisoned batch"));
        assert!(storage.get_file_hash(&key(dir.path(), "d.md")).unwrap().is_none());

        let cross = manager
            .index(
                dir.path(),
                &IndexOptions {
                    embed_batch_size: 100,
                    ..IndexOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(cross, IndexError::Store { batch: 1, .. }));
    }

    #[tokio::test]
    async fn test_update_replaces_changed_and_removes_deleted() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_tree(root);
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS));
        manager.index(root, &IndexOptions::default()).await.unwrap();

        // A path outside the root is left alone
        storage.set_file_hash("/elsewhere/x.md", "h").unwrap();

        let a = key(root, "a.md");
        let old_ids: Vec<String> = chunks_of(&storage, &a).into_iter().map(|c| c.id).collect();
        assert_eq!(old_ids.len(), 2);

        fs::write(
            root.join("a.md"),
            "intro\n\n# Alpha\n\nfirst\n\n## Beta\n\nsecond\n",
        )
        .unwrap();
        let result = manager.update(root, &UpdateOptions::default()).await.unwrap();
        assert_eq!(result.files_updated, 1);
        assert_eq!(result.files_removed, 0);
        assert_eq!(result.chunks_removed, 2);
        assert_eq!(result.chunks_created, 3);
        for id in &old_ids {
            assert!(storage.read_chunk(id).unwrap().is_none());
        }

        fs::remove_file(root.join("c.md")).unwrap();
        let result = manager.update(root, &UpdateOptions::default()).await.unwrap();
        assert_eq!(result.files_updated, 0);
        assert_eq!(result.files_removed, 1);
        assert_eq!(result.chunks_removed, 1);
        let c = key(root, "c.md");
        assert!(chunks_of(&storage, &c).is_empty());
        assert!(storage.get_file_hash(&c).unwrap().is_none());
        assert_eq!(
            storage.get_file_hash("/elsewhere/x.md").unwrap().as_deref(),
            Some("h")
        );

        let idle = manager.update(root, &UpdateOptions::default()).await.unwrap();
        assert_eq!(idle, UpdateResult::default());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        let token = CancellationToken::new();
        let storage = Arc::new(SqliteStorage::open_in_memory(DIMS).unwrap());
        let manager = IndexManager::new(storage.clone(), Arc::new(MockEmbedder::new(DIMS)), registry())
            .with_cancellation(token.clone());

        token.cancel();
        let err = manager.index(dir.path(), &IndexOptions::default()).await.unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
        let err = manager.update(dir.path(), &UpdateOptions::default()).await.unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));
        assert_eq!(storage.stats().unwrap().chunks_total, 0);
    }

    fn cancellable(storage: &Arc<SqliteStorage>, token: &CancellationToken) -> IndexManager {
        IndexManager::new(storage.clone(), Arc::new(MockEmbedder::new(DIMS)), registry())
            .with_cancellation(token.clone())
    }

    #[tokio::test]
    async fn test_cancelled_between_files_resumes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_tree(root);
        let storage = Arc::new(SqliteStorage::open_in_memory(DIMS).unwrap());
        let token = CancellationToken::new();
        let manager = cancellable(&storage, &token);

        let trigger = token.clone();
        let opts = IndexOptions {
            on_progress: Some(Arc::new(move |e: &ProgressEvent| {
                if e.current == 1 {
                    trigger.cancel();
                }
            })),
            ..IndexOptions::default()
        };
        let err = manager.index(root, &opts).await.unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));

        assert_eq!(chunks_of(&storage, &key(root, "a.md")).len(), 2);
        assert!(storage.get_file_hash(&key(root, "a.md")).unwrap().is_some());
        for name in ["b.md", "c.md"] {
            assert!(chunks_of(&storage, &key(root, name)).is_empty());
            assert!(storage.get_file_hash(&key(root, name)).unwrap().is_none());
        }

        let resumed = cancellable(&storage, &CancellationToken::new())
            .index(root, &IndexOptions::default())
            .await
            .unwrap();
        assert_eq!(resumed.files_unchanged, 1);
        assert_eq!(resumed.files_processed, 2);
        assert_eq!(resumed.chunks_created, 2);
        assert_eq!(storage.stats().unwrap().chunks_total, 4);
    }

    #[tokio::test]
    async fn test_cancelled_between_batches_resumes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_tree(root);
        let storage = Arc::new(SqliteStorage::open_in_memory(DIMS).unwrap());
        let token = CancellationToken::new();
        let manager = cancellable(&storage, &token);

        let trigger = token.clone();
        let opts = IndexOptions {
            embed_batch_size: 2,
            on_upload_progress: Some(Arc::new(move |e: &UploadProgressEvent| {
                if e.current == 1 {
                    trigger.cancel();
                }
            })),
            ..IndexOptions::default()
        };
        let err = manager.index(root, &opts).await.unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));

        // a.md alone filled the first batch
        assert_eq!(storage.stats().unwrap().chunks_total, 2);
        assert!(storage.get_file_hash(&key(root, "a.md")).unwrap().is_some());
        assert!(storage.get_file_hash(&key(root, "b.md")).unwrap().is_none());
        assert!(storage.get_file_hash(&key(root, "c.md")).unwrap().is_none());

        let resumed = cancellable(&storage, &CancellationToken::new())
            .index(
                root,
                &IndexOptions {
                    embed_batch_size: 2,
                    ..IndexOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resumed.files_unchanged, 1);
        assert_eq!(resumed.files_processed, 2);
        assert_eq!(storage.stats().unwrap().chunks_total, 4);
    }

    /// Cancels its token once the first embedding call has returned.
    struct CancelAfterFirstEmbed {
        inner: MockEmbedder,
        token: CancellationToken,
    }

    impl Embedder for CancelAfterFirstEmbed {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            self.inner.embed(text)
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
            let vectors = self.inner.embed_batch(texts);
            self.token.cancel();
            vectors
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model(&self) -> &str {
            self.inner.model()
        }
    }

    #[tokio::test]
    async fn test_update_cancelled_between_files_resumes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_tree(root);
        let storage = Arc::new(SqliteStorage::open_in_memory(DIMS).unwrap());
        cancellable(&storage, &CancellationToken::new())
            .index(root, &IndexOptions::default())
            .await
            .unwrap();

        let new_b = "# Gamma\n\nthird, revised\n";
        fs::write(root.join("b.md"), new_b).unwrap();
        fs::write(root.join("c.md"), "# Delta\n\nfourth, revised\n").unwrap();
        let old_c = storage.get_file_hash(&key(root, "c.md")).unwrap();

        let token = CancellationToken::new();
        let embedder = CancelAfterFirstEmbed {
            inner: MockEmbedder::new(DIMS),
            token: token.clone(),
        };
        let manager = IndexManager::new(storage.clone(), Arc::new(embedder), registry())
            .with_cancellation(token);
        let err = manager.update(root, &UpdateOptions::default()).await.unwrap_err();
        assert!(matches!(err, IndexError::Cancelled));

        assert_eq!(
            storage.get_file_hash(&key(root, "b.md")).unwrap(),
            Some(content_hash(new_b.as_bytes()))
        );
        assert_eq!(storage.get_file_hash(&key(root, "c.md")).unwrap(), old_c);

        let resumed = cancellable(&storage, &CancellationToken::new())
            .update(root, &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(resumed.files_updated, 1);
        assert_eq!(resumed.chunks_removed, 1);
        assert!(chunks_of(&storage, &key(root, "c.md"))[0].content.contains("revised"));
    }

    #[tokio::test]
    async fn test_domain_and_status() {
        let dir = tempdir().unwrap();
        write_tree(dir.path());
        let (storage, _, manager) = setup(MockEmbedder::new(DIMS));

        let opts = IndexOptions {
            domain: Some("docs".to_string()),
            ..IndexOptions::default()
        };
        manager.index(dir.path(), &opts).await.unwrap();
        let chunks = storage.list_chunks(&ListOptions::default()).unwrap();
        assert!(chunks.iter().all(|c| c.domain.as_deref() == Some("docs")));

        let stats = manager.status().await.unwrap();
        assert_eq!(stats.files_indexed, 3);
        assert_eq!(stats.chunks_total, 4);
        assert_eq!(stats.embedding_model.as_deref(), Some("mock"));
        assert!(stats.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let (_, _, manager) = setup(MockEmbedder::new(DIMS));
        let err = manager
            .index(&dir.path().join("nope"), &IndexOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::RootInaccessible { .. }));
    }

    #[tokio::test]
    async fn test_store_items_sequential_sub_batches() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory(4).unwrap());
        let items: Vec<ChunkWithEmbedding> = (0..7)
            .map(|i| ChunkWithEmbedding {
                chunk: Chunk::new("x.txt", crate::chunker::ChunkKind::File, format!("x{i}"), "x", i + 1, i + 1, "txt"),
                embedding: vec![0.5; 4],
            })
            .collect();
        store_items(&storage, items, 3, 1).await.unwrap();
        assert_eq!(storage.stats().unwrap().chunks_total, 7);
    }
}
