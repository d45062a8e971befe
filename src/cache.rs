//! # Response Cache
//!
//! Content-addressed cache of completed non-streaming generations. Keys
//! are SHA-256 digests over the generation parameters; entries expire on
//! a TTL. The cache is advisory: it can only ever save work, never gate
//! correctness, so every failure path degrades to a miss.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Digest over the full identity of a generation. Temperature is fixed
/// to two decimals so `0.7` and `0.70` address the same entry.
pub fn cache_key(model: &str, prompt: &str, temperature: f32, max_tokens: u32) -> String {
    let digest = Sha256::digest(
        format!("{}:{}:{:.2}:{}", model, prompt, temperature, max_tokens).as_bytes(),
    );
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Look up a completed response. Expired entries are removed on
    /// access and count as misses.
    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("cache hit for {}", &key[..key.len().min(16)]);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a completed response under the default TTL. Returns whether
    /// the value was stored.
    pub fn set(&self, key: &str, value: &str) -> bool {
        self.set_with_ttl(key, value, self.default_ttl)
    }

    pub fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry whose key starts with `prefix` (the empty prefix
    /// clears everything). Returns the number of removed entries.
    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            entries: self.entries.len(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_and_temperature_normalized() {
        let a = cache_key("m", "p", 0.7, 100);
        let b = cache_key("m", "p", 0.70, 100);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("m", "p", 0.8, 100));
        assert_ne!(a, cache_key("m", "q", 0.7, 100));
    }

    #[test]
    fn set_then_get_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        assert!(cache.set("k1", "hello"));
        assert_eq!(cache.get("k1"), Some("hello".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set_with_ttl("k1", "hello", Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.get("k1"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn missing_key_is_a_miss() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("absent"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn clear_prefix_counts_removals() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("aa1", "x");
        cache.set("aa2", "y");
        cache.set("bb1", "z");

        assert_eq!(cache.clear_prefix("aa"), 2);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.get("bb1"), Some("z".to_string()));
    }

    #[test]
    fn delete_removes_single_entry() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("k", "v");
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
    }

    #[test]
    fn hit_rate_reflects_history() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set("k", "v");
        cache.get("k");
        cache.get("missing");

        let stats = cache.stats();
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }
}
