/// Configuration module for semindex.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedder::{Embedder, KeywordEmbedder, MockEmbedder, OfflineEmbedder};
use crate::indexer::{IndexOptions, UpdateOptions};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./semindex.db".to_string()
}

fn default_search_top_k() -> usize {
    5
}

fn default_model_name() -> String {
    "keyword-fallback".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_offline_fallback() -> bool {
    true
}

fn default_offline_check_secs() -> u64 {
    30
}

fn default_markdown_max_size() -> usize {
    4000
}

fn default_generic_max_size() -> usize {
    2000
}

fn default_pattern_max_size() -> usize {
    1500
}

fn default_html_max_size() -> usize {
    4000
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Serve keyword vectors while the provider is unreachable.
    #[serde(default = "default_offline_fallback")]
    pub offline_fallback: bool,

    /// Seconds before an unreachable provider is tried again.
    #[serde(default = "default_offline_check_secs")]
    pub offline_check_secs: u64,
}

/// Per-format size limits in bytes.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_markdown_max_size")]
    pub markdown_max_size: usize,

    #[serde(default = "default_generic_max_size")]
    pub generic_max_size: usize,

    #[serde(default = "default_pattern_max_size")]
    pub pattern_max_size: usize,

    #[serde(default = "default_html_max_size")]
    pub html_max_size: usize,
}

/// Defaults for `index` and `update` runs.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct IndexingConfig {
    #[serde(default)]
    pub includes: Vec<String>,

    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub exclude_tests: bool,

    /// Chunks per storage write; 0 writes a whole commit at once.
    #[serde(default)]
    pub batch_size: usize,

    /// Concurrent storage writes; 0 or 1 is sequential.
    #[serde(default)]
    pub parallel: usize,

    /// Chunks per cross-file embedding call; 0 embeds file by file.
    #[serde(default)]
    pub embed_batch_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            search_top_k: default_search_top_k(),
            model: ModelConfig::default(),
            chunking: ChunkingConfig::default(),
            indexing: IndexingConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            dimensions: default_dimensions(),
            offline_fallback: default_offline_fallback(),
            offline_check_secs: default_offline_check_secs(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            markdown_max_size: default_markdown_max_size(),
            generic_max_size: default_generic_max_size(),
            pattern_max_size: default_pattern_max_size(),
            html_max_size: default_html_max_size(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; so does invalid JSON, with a warning.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        match serde_json::from_str(&data) {
            Ok(cfg) => {
                info!("Loaded configuration from {}", path.display());
                Ok(cfg)
            }
            Err(e) => {
                warn!("Invalid JSON in {}: {e}", path.display());
                warn!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.search_top_k > 0, "search_top_k must be positive");
        anyhow::ensure!(
            self.model.dimensions > 0,
            "model.dimensions must be positive"
        );
        anyhow::ensure!(
            self.chunking.markdown_max_size > 0
                && self.chunking.generic_max_size > 0
                && self.chunking.pattern_max_size > 0
                && self.chunking.html_max_size > 0,
            "chunking sizes must be positive"
        );
        Ok(())
    }
}

impl ModelConfig {
    /// Build the configured embedder.
    ///
    /// Provider-backed models are wrapped in [`OfflineEmbedder`] unless
    /// `offline_fallback` is off. `keyword-fallback` is never wrapped.
    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>> {
        match self.name.as_str() {
            "keyword-fallback" => Ok(Arc::new(KeywordEmbedder::new(self.dimensions))),
            "mock" => Ok(self.with_offline_fallback(MockEmbedder::new(self.dimensions))),
            other => bail!("unknown embedding model: {other} (expected keyword-fallback or mock)"),
        }
    }

    fn with_offline_fallback<E: Embedder + 'static>(&self, primary: E) -> Arc<dyn Embedder> {
        if !self.offline_fallback {
            return Arc::new(primary);
        }
        Arc::new(
            OfflineEmbedder::new(primary)
                .with_check_interval(Duration::from_secs(self.offline_check_secs)),
        )
    }
}

impl IndexingConfig {
    /// Options for a full or incremental `index` run.
    pub fn index_options(&self, force: bool) -> IndexOptions {
        IndexOptions {
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            exclude_tests: self.exclude_tests,
            force,
            batch_size: self.batch_size,
            parallel: self.parallel,
            embed_batch_size: self.embed_batch_size,
            domain: self.domain.clone(),
            ..IndexOptions::default()
        }
    }

    /// Options for an `update` run.
    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
            exclude_tests: self.exclude_tests,
            batch_size: self.batch_size,
            parallel: self.parallel,
            domain: self.domain.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
