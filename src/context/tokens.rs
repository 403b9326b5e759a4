//! Token estimation
//!
//! The default estimator counts whitespace-delimited words. Text in scripts
//! written without spaces (CJK) counts as one token per run; that is a known
//! limitation of this estimator. Budget arithmetic only needs a monotonic
//! cost function, so the estimator is pluggable.

use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::warn;

use crate::config::EstimatorKind;

/// Approximate cost of a text span in model-context units.
pub trait TokenEstimator: Send + Sync {
    /// Never fails; the empty string costs 0.
    fn estimate(&self, text: &str) -> u32;

    fn estimate_all(&self, texts: &[&str]) -> u32 {
        texts.iter().map(|t| self.estimate(t)).sum()
    }
}

/// Counts whitespace-delimited tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceEstimator;

impl TokenEstimator for WhitespaceEstimator {
    fn estimate(&self, text: &str) -> u32 {
        text.split_whitespace().count() as u32
    }
}

/// Cache for token counts, keyed by content hash
struct TokenCache {
    cache: HashMap<u64, u32>,
    max_size: usize,
}

impl TokenCache {
    fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    fn get(&self, hash: u64) -> Option<u32> {
        self.cache.get(&hash).copied()
    }

    fn insert(&mut self, hash: u64, count: u32) {
        // At capacity: drop half the entries
        if self.cache.len() >= self.max_size {
            let keys_to_remove: Vec<_> = self.cache.keys().take(self.max_size / 2).copied().collect();
            for key in keys_to_remove {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(hash, count);
    }
}

fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// cl100k_base BPE counts, cached per instance.
///
/// Falls back to whitespace counting if the encoder cannot be built.
pub struct Cl100kEstimator {
    bpe: Option<Mutex<CoreBPE>>,
    cache: RwLock<TokenCache>,
}

impl Cl100kEstimator {
    pub fn new() -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(Mutex::new(bpe)),
            Err(e) => {
                warn!(error = %e, "cl100k encoder unavailable, counting whitespace tokens");
                None
            }
        };
        Self {
            bpe,
            cache: RwLock::new(TokenCache::new(10_000)),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().cache.len()
    }
}

impl Default for Cl100kEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for Cl100kEstimator {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let Some(bpe) = &self.bpe else {
            return WhitespaceEstimator.estimate(text);
        };

        let content_hash = hash_content(text);
        if let Some(count) = self.cache.read().get(content_hash) {
            return count;
        }

        let count = bpe.lock().encode_with_special_tokens(text).len() as u32;
        self.cache.write().insert(content_hash, count);
        count
    }
}

/// Build the configured estimator
pub fn estimator_for(kind: EstimatorKind) -> Arc<dyn TokenEstimator> {
    match kind {
        EstimatorKind::Whitespace => Arc::new(WhitespaceEstimator),
        EstimatorKind::Cl100k => Arc::new(Cl100kEstimator::new()),
    }
}
