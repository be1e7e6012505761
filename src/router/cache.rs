/// Two-tier result cache: a bounded in-process map and an optional shared tier
use crate::core::QueryResult;
use crate::error::CacheError;
use crate::utils::glob_match;
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// External cache shared between router instances
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<QueryResult>, CacheError>;

    async fn set(&self, key: &str, value: &QueryResult, ttl: Duration) -> Result<(), CacheError>;

    /// Remove keys matching `pattern` (all keys when `None`), returning
    /// how many were removed
    async fn clear(&self, pattern: Option<&str>) -> Result<u64, CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: QueryResult,
    stored_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

/// Bounded in-process cache.
///
/// When full, the entry with the fewest hits is evicted, the oldest among
/// equals.
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<FnvHashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl LocalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(FnvHashMap::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FnvHashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<QueryResult> {
        let mut entries = self.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hit_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &str, value: QueryResult, ttl: Duration) {
        let mut entries = self.lock();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let victim = entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.hit_count
                        .cmp(&b.hit_count)
                        .then_with(|| a.stored_at.cmp(&b.stored_at))
                })
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                tracing::trace!("Evicted cache entry {}", victim);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
                hit_count: 0,
            },
        );
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Remove keys matching the glob `pattern`, or everything
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        match pattern {
            Some(pattern) => entries.retain(|key, _| !glob_match(pattern, key)),
            None => entries.clear(),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Row, SqlValue};

    fn result(id: i64) -> QueryResult {
        QueryResult::new(vec![Row::from_pairs([("id", SqlValue::Int(id))])])
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = LocalCache::new(10);
        cache.insert("q:areas:1", result(1), Duration::from_secs(60));
        assert_eq!(cache.get("q:areas:1"), Some(result(1)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("q:areas:1"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = LocalCache::new(10);
        cache.insert("short", result(1), Duration::from_secs(1));
        cache.insert("long", result(2), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_by_hits_then_age() {
        let cache = LocalCache::new(3);
        let ttl = Duration::from_secs(60);
        cache.insert("a", result(1), ttl);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("b", result(2), ttl);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("c", result(3), ttl);

        cache.get("a");
        cache.get("c");
        cache.insert("d", result(4), ttl);
        assert!(cache.get("b").is_none());

        // d is the newest entry but has no hits, so it goes before a and c
        cache.insert("e", result(5), ttl);
        assert!(cache.get("d").is_none());
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_clear_pattern() {
        let cache = LocalCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.insert("q:properties:01", result(1), ttl);
        cache.insert("q:properties,areas:02", result(2), ttl);
        cache.insert("q:areas:03", result(3), ttl);

        assert_eq!(cache.clear(Some("q:properties*")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(None), 1);
    }
}
