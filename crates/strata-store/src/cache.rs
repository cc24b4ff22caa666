//! Time-bounded, size-bounded caches shared by all clones of a factory.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use strata_types::{Timestamp, Urn};

use crate::object::{Mode, ObjectState};

/// LRU cache whose entries also expire `max_age` after insertion.
pub(crate) struct TimedCache<K: Hash + Eq, V> {
    entries: LruCache<K, (Timestamp, V)>,
    max_age: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TimedCache<K, V> {
    pub(crate) fn new(capacity: usize, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age,
        }
    }

    /// Returns the entry if it is younger than `max_age` at `now`.
    pub(crate) fn get(&mut self, key: &K, now: Timestamp) -> Option<V> {
        let inserted = self.entries.get(key)?.0;
        if now.duration_since(inserted) >= self.max_age {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|(_, value)| value.clone())
    }

    pub(crate) fn put(&mut self, key: K, value: V, now: Timestamp) {
        self.entries.put(key, (now, value));
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|(_, value)| value)
    }

    /// Keep only the entries for which `keep` returns `true`.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(key, (_, value))| !keep(key, value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.entries.pop(key);
        }
        doomed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Key of a cached object: URN, open mode and requested type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) urn: Urn,
    pub(crate) mode: Mode,
    pub(crate) type_name: Option<String>,
}

/// Process-wide cache of recently resolved object snapshots.
///
/// Only positive lookups are stored. A hit returns the snapshot as it was
/// resolved, even if the substrate changed since; every flush, pool flush
/// and delete through the owning factory invalidates the affected URN.
pub struct ObjectCache {
    entries: Mutex<TimedCache<CacheKey, ObjectState>>,
}

impl ObjectCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(TimedCache::new(capacity, max_age)),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey, now: Timestamp) -> Option<ObjectState> {
        self.entries.lock().expect("lock poisoned").get(key, now)
    }

    pub(crate) fn put(&self, key: CacheKey, state: ObjectState, now: Timestamp) {
        self.entries.lock().expect("lock poisoned").put(key, state, now);
    }

    /// Drop every entry that was requested as, or resolved to, `urn`.
    pub fn invalidate(&self, urn: &Urn) {
        let removed = self
            .entries
            .lock()
            .expect("lock poisoned")
            .retain(|key, state| key.urn != *urn && state.urn() != urn);
        if removed > 0 {
            tracing::debug!(urn = %urn, removed, "object cache invalidated");
        }
    }

    /// Drop every entry for `urn` and its descendants.
    pub fn invalidate_tree(&self, root: &Urn) {
        let covers = |urn: &Urn| urn == root || root.is_ancestor_of(urn);
        self.entries
            .lock()
            .expect("lock poisoned")
            .retain(|key, state| !covers(&key.urn) && !covers(state.urn()));
    }

    pub fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache").field("len", &self.len()).finish()
    }
}

/// URNs recently recorded in their parent's child index.
pub(crate) struct IntermediateCache {
    entries: Mutex<TimedCache<Urn, ()>>,
}

impl IntermediateCache {
    pub(crate) fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: Mutex::new(TimedCache::new(capacity, max_age)),
        }
    }

    pub(crate) fn contains(&self, urn: &Urn, now: Timestamp) -> bool {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(urn, now)
            .is_some()
    }

    pub(crate) fn insert_all(&self, urns: &[Urn], now: Timestamp) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        for urn in urns {
            entries.put(urn.clone(), (), now);
        }
    }

    pub(crate) fn forget(&self, urn: &Urn) {
        self.entries.lock().expect("lock poisoned").remove(urn);
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn entries_expire_after_max_age() {
        let mut cache: TimedCache<u32, &str> = TimedCache::new(10, Duration::from_secs(5));
        cache.put(1, "one", ts(100));
        assert_eq!(cache.get(&1, ts(104)), Some("one"));
        assert_eq!(cache.get(&1, ts(105)), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache: TimedCache<u32, u32> = TimedCache::new(2, Duration::from_secs(60));
        cache.put(1, 10, ts(1));
        cache.put(2, 20, ts(1));
        assert_eq!(cache.get(&1, ts(1)), Some(10));
        cache.put(3, 30, ts(1));
        assert_eq!(cache.get(&2, ts(1)), None);
        assert_eq!(cache.get(&1, ts(1)), Some(10));
        assert_eq!(cache.get(&3, ts(1)), Some(30));
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let mut cache: TimedCache<u32, u32> = TimedCache::new(0, Duration::from_secs(60));
        cache.put(1, 1, ts(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn retain_reports_removed_count() {
        let mut cache: TimedCache<u32, u32> = TimedCache::new(10, Duration::from_secs(60));
        for i in 0..6 {
            cache.put(i, i, ts(1));
        }
        assert_eq!(cache.retain(|k, _| k % 2 == 0), 3);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn intermediate_cache_window() {
        let cache = IntermediateCache::new(10, Duration::from_secs(600));
        let urn = Urn::parse("/p/c").unwrap();
        cache.insert_all(std::slice::from_ref(&urn), ts(100));
        assert!(cache.contains(&urn, ts(699)));
        assert!(!cache.contains(&urn, ts(700)));

        cache.insert_all(std::slice::from_ref(&urn), ts(800));
        cache.forget(&urn);
        assert!(!cache.contains(&urn, ts(800)));
    }
}
