//! Small in-memory cache with per-entry time-to-live.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Key/value cache whose entries go stale after a fixed TTL.
///
/// Stale entries are kept (not evicted) so callers can fall back to the last
/// known value when a refresh fails; see [`TtlCache::get_stale`].
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
    on_invalidate: Option<InvalidationHook<K>>,
}

/// Called with the key whenever an entry is explicitly invalidated.
pub type InvalidationHook<K> = Box<dyn Fn(&K) + Send + Sync>;

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            on_invalidate: None,
        }
    }

    /// Attach a hook run on every [`TtlCache::invalidate`].
    pub fn with_invalidation_hook(mut self, hook: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.on_invalidate = Some(Box::new(hook));
        self
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    /// Last stored value for `key`, fresh or not, with its age.
    pub fn get_stale(&self, key: &K) -> Option<(V, Duration)> {
        self.entries
            .get(key)
            .map(|e| (e.value.clone(), e.stored_at.elapsed()))
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop one entry so the next read refetches.
    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
        if let Some(hook) = &self.on_invalidate {
            hook(key);
        }
    }

    /// Drop entries stored more than `max_age` ago. The invalidation hook is
    /// not run. Returns how many were dropped.
    pub fn prune_older_than(&mut self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stored_at.elapsed() <= max_age);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_and_stale_reads() {
        let mut cache = TtlCache::new(Duration::from_millis(20));
        cache.insert("balance", 100u32);
        assert_eq!(cache.get(&"balance"), Some(100));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"balance"), None);

        let (value, age) = cache.get_stale(&"balance").unwrap();
        assert_eq!(value, 100);
        assert!(age >= Duration::from_millis(20));
    }

    #[test]
    fn test_invalidate() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mut cache = TtlCache::new(Duration::from_secs(60)).with_invalidation_hook(move |_k: &i32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.insert(1, "a".to_string());
        cache.insert(2, "b".to_string());
        cache.invalidate(&1);

        assert!(cache.get(&1).is_none());
        assert!(cache.get_stale(&1).is_none());
        assert_eq!(cache.get(&2).as_deref(), Some("b"));
        assert_eq!(cache.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prune_drops_only_old_entries() {
        let mut cache = TtlCache::new(Duration::from_millis(5));
        cache.insert("old", 1u32);
        std::thread::sleep(Duration::from_millis(40));
        cache.insert("new", 2u32);

        assert_eq!(cache.prune_older_than(Duration::from_millis(20)), 1);
        assert!(cache.get_stale(&"old").is_none());
        assert_eq!(cache.get_stale(&"new").map(|(v, _)| v), Some(2));
    }
}
