use std::{any::Any, num::NonZeroUsize, sync::Arc, time::Duration};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::bus::ChannelKey;

/// Channel plus fingerprint of the query value.
pub type CacheKey = (ChannelKey, u64);

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    written: Instant,
}

/// Bounded LRU of successful query results. Entries expire `ttl` after they
/// were written; reads refresh recency but not age.
pub struct QueryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        QueryCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get<R: Clone + 'static>(&self, key: &CacheKey, ttl: Duration) -> Option<R> {
        let mut entries = self.entries.lock();
        let fresh = entries.get(key).map(|e| e.written.elapsed() <= ttl)?;
        if !fresh {
            entries.pop(key);
            trace!(channel = %key.0, "Cached query result expired");
            return None;
        }
        entries.get(key)?.value.downcast_ref::<R>().cloned()
    }

    pub fn insert<R: Send + Sync + 'static>(&self, key: CacheKey, value: R) {
        let entry = CacheEntry {
            value: Arc::new(value),
            written: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.lock().push(key, entry) {
            if evicted != key {
                trace!(channel = %evicted.0, "Evicted least recently used query result");
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Drops every entry of `channel` and returns how many there were.
    pub fn remove_channel(&self, channel: &ChannelKey) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| &key.0 == channel)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> CacheKey {
        (ChannelKey::query::<u64, String>(), n)
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = QueryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.insert(key(1), "one".to_string());
        cache.insert(key(2), "two".to_string());
        assert_eq!(cache.get::<String>(&key(1), ttl).as_deref(), Some("one"));

        cache.insert(key(3), "three".to_string());
        assert_eq!(cache.len(), 2);
        assert!(cache.get::<String>(&key(2), ttl).is_none());
        assert!(cache.get::<String>(&key(1), ttl).is_some());
        assert!(cache.get::<u32>(&key(1), ttl).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = QueryCache::new(8);
        let ttl = Duration::from_secs(5);
        cache.insert(key(1), 10u32);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get::<u32>(&key(1), ttl), Some(10));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get::<u32>(&key(1), ttl), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_channel_keeps_other_channels() {
        let cache = QueryCache::new(8);
        cache.insert(key(1), 1u32);
        cache.insert(key(2), 2u32);
        cache.insert((ChannelKey::query::<u8, String>(), 1), 3u32);
        assert_eq!(cache.remove_channel(&ChannelKey::query::<u64, String>()), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.remove(&(ChannelKey::query::<u8, String>(), 1)));
        cache.clear();
        assert_eq!(cache.capacity(), 8);
    }
}
