use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::db::Storage;

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Decides whether a file needs (re)indexing by comparing its content hash
/// with the stored checkpoint.
#[derive(Clone)]
pub struct ContentHashGate {
    storage: Arc<dyn Storage>,
}

impl ContentHashGate {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// True unless a checkpoint for `file_path` exists and equals `hash`.
    /// A failed lookup counts as "needs indexing".
    pub fn needs_index(&self, file_path: &str, hash: &str) -> bool {
        match self.storage.get_file_hash(file_path) {
            Ok(Some(stored)) => stored.is_empty() || stored != hash,
            Ok(None) => true,
            Err(e) => {
                warn!(file = %file_path, error = %e, "Checkpoint lookup failed");
                true
            }
        }
    }

    /// Hashes `content` and checks it against the checkpoint.
    pub fn check(&self, file_path: &str, content: &[u8]) -> (bool, String) {
        let hash = content_hash(content);
        (self.needs_index(file_path, &hash), hash)
    }
}
