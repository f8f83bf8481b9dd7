//! In-memory LRU translation cache with TTL.
//! Key: blake3 hash of (src_lang | tgt_lang | source_text).
//! Expired entries read as absent before the sweep gets to them.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

type CacheKey = [u8; 32];

struct CacheEntry {
    translated_text: String,
    inserted_at: Instant,
}

pub struct TranslationCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl TranslationCache {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn compute_key(src_lang: &str, tgt_lang: &str, source_text: &str) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(src_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(tgt_lang.as_bytes());
        hasher.update(b"|");
        hasher.update(source_text.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Cached translation, promoted to most-recently-used. `None` if absent or expired.
    pub fn get(&self, source_text: &str, src_lang: &str, tgt_lang: &str) -> Option<String> {
        let key = Self::compute_key(src_lang, tgt_lang, source_text);
        let mut cache = self.inner.lock();
        let entry = cache.get(&key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            return Some(entry.translated_text.clone());
        }
        cache.pop(&key);
        None
    }

    /// Insert or overwrite. Evicts the least-recently-used entry when full.
    pub fn put(&self, source_text: &str, src_lang: &str, tgt_lang: &str, translated_text: String) {
        let key = Self::compute_key(src_lang, tgt_lang, source_text);
        let mut cache = self.inner.lock();
        cache.put(
            key,
            CacheEntry {
                translated_text,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut cache = self.inner.lock();
        let expired: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = cache.len(), "translation cache sweep");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
