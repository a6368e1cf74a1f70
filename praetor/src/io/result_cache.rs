//! Content-addressed cache of successful task results.
//!
//! Identical work (same role, prompt, model, and tier) completes from the
//! cache without starting an execution unit. Entries expire after a TTL and
//! the oldest entry is evicted first once the cache is full. In-memory only.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::io::config::ResultCacheConfig;
use crate::task::{Task, TokenUsage};

/// Cache key for `task`: hex sha256 over role, prompt, model, and tier,
/// separated by NUL bytes.
pub fn cache_key(task: &Task) -> String {
    let spec = &task.spec;
    let model = spec.model.as_ref().map_or("", |model| model.name.as_str());
    let mut hasher = Sha256::new();
    for (i, part) in [
        spec.role.as_deref().unwrap_or(""),
        spec.prompt.as_str(),
        model,
        spec.tier.as_str(),
    ]
    .into_iter()
    .enumerate()
    {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub output: String,
    pub tokens: Option<TokenUsage>,
    pub model: String,
}

#[derive(Debug)]
struct Entry {
    result: CachedResult,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Thread-safe result cache.
#[derive(Debug)]
pub struct ResultCache {
    config: ResultCacheConfig,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(config: ResultCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        self.inner.lock().ok()
    }

    fn ttl(&self) -> Duration {
        i64::try_from(self.config.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Cached result for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResult> {
        if !self.config.enabled {
            return None;
        }
        let ttl = self.ttl();
        let mut inner = self.lock()?;
        let entry = inner.entries.get(key)?;
        if now - entry.cached_at > ttl {
            inner.entries.remove(key);
            debug!(key, "cache entry expired");
            return None;
        }
        Some(entry.result.clone())
    }

    /// Store a successful result. An existing entry for `key` is kept.
    pub fn put(&self, key: &str, result: CachedResult, now: DateTime<Utc>) {
        if !self.config.enabled || self.config.max_entries == 0 {
            return;
        }
        let Some(mut inner) = self.lock() else {
            return;
        };
        if inner.entries.contains_key(key) {
            return;
        }
        while inner.entries.len() >= self.config.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                debug!(key = %oldest, "cache entry evicted");
            }
        }
        inner.order.retain(|existing| existing != key);
        inner.entries.insert(
            key.to_string(),
            Entry {
                result,
                cached_at: now,
            },
        );
        inner.order.push_back(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, task};

    fn cache(max_entries: usize) -> ResultCache {
        ResultCache::new(ResultCacheConfig {
            enabled: true,
            ttl_secs: 600,
            max_entries,
        })
    }

    fn result(output: &str) -> CachedResult {
        CachedResult {
            output: output.to_string(),
            tokens: Some(TokenUsage::new(10, 5)),
            model: "claude-sonnet".to_string(),
        }
    }

    #[test]
    fn key_depends_on_role_prompt_model_and_tier() {
        let base = task("a");
        let same = task("b");
        assert_eq!(cache_key(&base), cache_key(&same));
        assert_eq!(cache_key(&base).len(), 64);

        let mut other_role = task("c");
        other_role.spec.role = Some("reviewer".to_string());
        assert_ne!(cache_key(&base), cache_key(&other_role));

        let mut other_tier = task("d");
        other_tier.spec.tier = crate::task::Tier::Centurion;
        assert_ne!(cache_key(&base), cache_key(&other_tier));
    }

    /// NUL separators keep shifted boundaries from colliding.
    #[test]
    fn key_separates_fields() {
        let mut left = task("a");
        left.spec.role = Some("ab".to_string());
        left.spec.prompt = "c".to_string();
        let mut right = task("b");
        right.spec.role = Some("a".to_string());
        right.spec.prompt = "bc".to_string();
        assert_ne!(cache_key(&left), cache_key(&right));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = cache(10);
        cache.put("k", result("out"), at(0));
        assert_eq!(cache.get("k", at(600)), Some(result("out")));
        assert_eq!(cache.get("k", at(601)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn oldest_entry_is_evicted_first() {
        let cache = cache(2);
        cache.put("a", result("1"), at(0));
        cache.put("b", result("2"), at(1));
        cache.put("c", result("3"), at(2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", at(3)), None);
        assert!(cache.get("b", at(3)).is_some());
        assert!(cache.get("c", at(3)).is_some());
    }

    #[test]
    fn duplicate_put_keeps_first_result() {
        let cache = cache(10);
        cache.put("k", result("first"), at(0));
        cache.put("k", result("second"), at(1));
        assert_eq!(cache.get("k", at(2)).map(|r| r.output), Some("first".to_string()));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ResultCache::new(ResultCacheConfig {
            enabled: false,
            ..ResultCacheConfig::default()
        });
        cache.put("k", result("out"), at(0));
        assert_eq!(cache.get("k", at(0)), None);
    }
}
