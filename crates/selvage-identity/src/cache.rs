//! Time-bounded caches for resolution results.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A concurrent cache whose entries expire a fixed duration after
/// insertion. Expired entries are dropped lazily on read.
///
/// Cloning shares the underlying map, so one cache can back many handles
/// to the same resolver.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Arc<DashMap<K, (Instant, V)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with the given time-to-live.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Fetch an unexpired entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (inserted, value) = entry.value();
                if inserted.elapsed() < self.ttl {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert or replace an entry, restarting its clock.
    pub fn put(&self, key: K, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Drop an entry regardless of age.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
    }

    #[test]
    fn expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_millis(5));
        cache.put("k", 1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn put_restarts_clock() {
        let cache = TtlCache::new(Duration::from_millis(40));
        cache.put("k", 1);
        std::thread::sleep(Duration::from_millis(25));
        cache.put("k", 2);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", 1);
        cache.invalidate(&"k");
        assert_eq!(cache.get(&"k"), None);
    }
}
