//! Keyword-hash embeddings and a wrapper that falls back to them while the
//! primary provider is unreachable.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{Embedder, EmbedderError, l2_normalize};

const DEFAULT_KEYWORD_DIMENSIONS: usize = 1024;

/// How long the fallback stays engaged before the primary is tried again.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// 32-bit FNV-1a.
fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for b in s.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Deterministic bag-of-words embedder that needs no model.
///
/// Words (lowercase ASCII letters, digits and `_`) hash into buckets, with
/// earlier words weighted slightly higher. Adjacent word pairs add a half
/// weight to their own bucket. Texts sharing vocabulary land close together.
#[derive(Debug, Clone)]
pub struct KeywordEmbedder {
    dimensions: usize,
}

impl KeywordEmbedder {
    /// Zero dimensions selects the default width of 1024.
    pub fn new(dimensions: usize) -> Self {
        let dimensions = if dimensions == 0 {
            DEFAULT_KEYWORD_DIMENSIONS
        } else {
            dimensions
        };
        Self { dimensions }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let dims = self.dimensions;
        let mut embedding = vec![0.0f32; dims];

        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'))
            .filter(|w| !w.is_empty())
            .collect();

        for (i, word) in words.iter().enumerate() {
            if word.len() < 2 {
                continue;
            }
            let pos = fnv1a(word) as usize % dims;
            embedding[pos] += 1.0;
            let position_weight = 1.0 / (1 + i / 5) as f32;
            embedding[pos] *= 1.0 + position_weight * 0.1;

            if let Some(next) = words.get(i + 1) {
                let bigram = format!("{word}_{next}");
                embedding[fnv1a(&bigram) as usize % dims] += 0.5;
            }
        }

        l2_normalize(&mut embedding);
        embedding
    }
}

impl Embedder for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.vector(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        "keyword-fallback"
    }
}

/// Wraps a primary embedder; on a network failure it serves
/// [`KeywordEmbedder`] vectors and tries the primary again once
/// `check_interval` has passed. Other errors propagate unchanged.
pub struct OfflineEmbedder<E> {
    primary: E,
    fallback: KeywordEmbedder,
    check_interval: Duration,
    /// When the fallback was engaged; `None` while online.
    offline_since: Mutex<Option<Instant>>,
}

impl<E: Embedder> OfflineEmbedder<E> {
    pub fn new(primary: E) -> Self {
        let fallback = KeywordEmbedder::new(primary.dimensions());
        Self {
            primary,
            fallback,
            check_interval: DEFAULT_CHECK_INTERVAL,
            offline_since: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn is_offline(&self) -> bool {
        self.state().is_some()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.offline_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_try_primary(&self) -> bool {
        match *self.state() {
            None => true,
            Some(since) => since.elapsed() >= self.check_interval,
        }
    }

    fn with_fallback<T>(
        &self,
        primary: impl FnOnce(&E) -> Result<T, EmbedderError>,
        fallback: impl FnOnce(&KeywordEmbedder) -> Result<T, EmbedderError>,
    ) -> Result<T, EmbedderError> {
        if self.should_try_primary() {
            match primary(&self.primary) {
                Ok(value) => {
                    let mut state = self.state();
                    if state.take().is_some() {
                        info!(model = self.primary.model(), "Embedding provider reachable again");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_network() => {
                    warn!(error = %e, "Embedding provider unreachable, using keyword fallback");
                    *self.state() = Some(Instant::now());
                }
                Err(e) => return Err(e),
            }
        }
        fallback(&self.fallback)
    }
}

impl<E: Embedder> Embedder for OfflineEmbedder<E> {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.with_fallback(|p| p.embed(text), |f| f.embed(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        self.with_fallback(|p| p.embed_batch(texts), |f| f.embed_batch(texts))
    }

    fn dimensions(&self) -> usize {
        match self.primary.dimensions() {
            0 => self.fallback.dimensions(),
            dims => dims,
        }
    }

    fn model(&self) -> &str {
        if self.is_offline() {
            self.fallback.model()
        } else {
            self.primary.model()
        }
    }
}
