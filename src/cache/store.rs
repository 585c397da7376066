//! Access-ordered holding store with spill-back eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge};
use tracing::{debug, info};

use super::clock::{AccessClock, Stamp};
use super::config::CacheConfig;
use super::lock::mutex_lock;
use super::sink::{PersistenceSink, SpillError};

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "riserva_cache_hit_total";
const METRIC_CACHE_MISS: &str = "riserva_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "riserva_cache_evict_total";
const METRIC_CACHE_SPILL: &str = "riserva_cache_spill_total";
const METRIC_CACHE_LEN: &str = "riserva_cache_len";

/// A cached payload, tagged with how the store treats it on the way out.
///
/// `Opaque` values are dropped silently when evicted, popped, or flushed.
/// `Persistable` values carry a durable handle together with the path it
/// belongs at; the store forwards both to the persistence sink exactly once
/// when it gives the entry up. Which fate a value gets is decided by the
/// caller at insert time through this tag, never inferred from the payload
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue<V> {
    /// Payload the store never persists.
    Opaque(V),
    /// Payload spilled to `destination` when the store gives it up.
    Persistable { handle: V, destination: PathBuf },
}

struct Entry<V> {
    value: CacheValue<V>,
    stamp: Stamp,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    clock: AccessClock,
}

/// Capacity-bounded, access-ordered holding cache with spill-back eviction.
///
/// Construct one store at service startup and share it by `Arc`; every
/// operation serializes on an internal lock, so the eviction sequence
/// (check size, pick victim, unlink, spill) is observed as atomic by
/// concurrent request handlers. Sink dispatch happens after the victim has
/// been unlinked and the lock released, so cache availability never waits
/// on sink I/O.
pub struct SpillCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    sink: Arc<dyn PersistenceSink<V>>,
    capacity: usize,
}

impl<K, V> SpillCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a store with the configured capacity, bound to the sink that
    /// receives spilled entries.
    pub fn new(config: &CacheConfig, sink: Arc<dyn PersistenceSink<V>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: AccessClock::new(),
            }),
            sink,
            capacity: config.capacity_non_zero().get(),
        }
    }

    /// Maximum number of entries held in memory.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        mutex_lock(&self.inner, SOURCE, "len").entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys currently held.
    pub fn keys(&self) -> Vec<K> {
        let inner = mutex_lock(&self.inner, SOURCE, "keys");
        inner.entries.keys().cloned().collect()
    }

    /// All current entries, oldest touch first.
    ///
    /// The returned order is exactly the order in which entries become
    /// eviction victims.
    pub fn stack(&self) -> Vec<(K, CacheValue<V>, Stamp)> {
        let inner = mutex_lock(&self.inner, SOURCE, "stack");
        let mut entries: Vec<_> = inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.stamp))
            .collect();
        entries.sort_by_key(|(_, _, stamp)| *stamp);
        entries
    }

    /// Return the value held for `key`, refreshing its stamp so the entry
    /// becomes the most recently used.
    ///
    /// A miss returns `None` and mutates nothing.
    pub fn read(&self, key: &K) -> Option<CacheValue<V>> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "read");
        let Inner { entries, clock } = &mut *inner;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.stamp = clock.next_stamp();
                counter!(METRIC_CACHE_HIT).increment(1);
                Some(entry.value.clone())
            }
            None => {
                counter!(METRIC_CACHE_MISS).increment(1);
                None
            }
        }
    }

    /// Insert or overwrite `key` with a fresh stamp, then evict the
    /// least-recently-touched entries one at a time until the store is back
    /// within capacity.
    ///
    /// Victims are unlinked before the sink sees them; a sink failure
    /// propagates to the caller with the victim staying removed.
    pub fn add(&self, key: K, value: CacheValue<V>) -> Result<(), SpillError> {
        let spilled = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "add");
            let Inner { entries, clock } = &mut *inner;
            let stamp = clock.next_stamp();
            entries.insert(key, Entry { value, stamp });

            let mut spilled = Vec::new();
            while entries.len() > self.capacity {
                // Stamps are unique, so the minimum picks exactly one
                // victim; the map is over capacity here, hence non-empty.
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stamp)
                    .map(|(key, _)| key.clone());
                let Some(victim) = victim else { break };
                if let Some(entry) = entries.remove(&victim) {
                    counter!(METRIC_CACHE_EVICT).increment(1);
                    if let CacheValue::Persistable {
                        handle,
                        destination,
                    } = entry.value
                    {
                        spilled.push((handle, destination));
                    }
                }
            }
            gauge!(METRIC_CACHE_LEN).set(entries.len() as f64);
            spilled
        };

        self.dispatch(spilled)
    }

    /// Remove and return the value held for `key`.
    ///
    /// A persistable value is forwarded to the sink exactly once before it
    /// is returned; an absent key is a no-op returning `Ok(None)` with no
    /// sink call.
    pub fn pop(&self, key: &K) -> Result<Option<CacheValue<V>>, SpillError> {
        let removed = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "pop");
            let removed = inner.entries.remove(key);
            gauge!(METRIC_CACHE_LEN).set(inner.entries.len() as f64);
            removed
        };

        let Some(entry) = removed else {
            return Ok(None);
        };
        if let CacheValue::Persistable {
            handle,
            destination,
        } = &entry.value
        {
            self.spill(handle, destination)?;
        }
        Ok(Some(entry.value))
    }

    /// Remove every entry and rearm the clock so the next touch is stamped
    /// `0`.
    ///
    /// Persistable entries reach the sink in eviction order. The first sink
    /// failure propagates with the store already empty; there is no
    /// rollback.
    pub fn flush(&self) -> Result<(), SpillError> {
        let spilled = {
            let mut inner = mutex_lock(&self.inner, SOURCE, "flush");
            let Inner { entries, clock } = &mut *inner;
            let mut drained: Vec<Entry<V>> = entries.drain().map(|(_, entry)| entry).collect();
            drained.sort_by_key(|entry| entry.stamp);
            clock.reset(0);
            gauge!(METRIC_CACHE_LEN).set(0.0);
            drained
                .into_iter()
                .filter_map(|entry| match entry.value {
                    CacheValue::Persistable {
                        handle,
                        destination,
                    } => Some((handle, destination)),
                    CacheValue::Opaque(_) => None,
                })
                .collect::<Vec<_>>()
        };

        info!(spill_count = spilled.len(), "Holding cache flushed");
        self.dispatch(spilled)
    }

    fn dispatch(&self, spilled: Vec<(V, PathBuf)>) -> Result<(), SpillError> {
        for (handle, destination) in spilled {
            self.spill(&handle, &destination)?;
        }
        Ok(())
    }

    fn spill(&self, handle: &V, destination: &PathBuf) -> Result<(), SpillError> {
        debug!(
            destination = %destination.display(),
            "Handing evicted model to persistence sink"
        );
        counter!(METRIC_CACHE_SPILL).increment(1);
        self.sink.persist(handle, destination)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::path::Path;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<(String, PathBuf)> {
            self.calls.lock().expect("sink call log").clone()
        }
    }

    impl PersistenceSink<String> for RecordingSink {
        fn persist(&self, handle: &String, destination: &Path) -> Result<(), SpillError> {
            self.calls
                .lock()
                .expect("sink call log")
                .push((handle.clone(), destination.to_path_buf()));
            Ok(())
        }
    }

    struct FailingSink;

    impl PersistenceSink<String> for FailingSink {
        fn persist(&self, _handle: &String, destination: &Path) -> Result<(), SpillError> {
            Err(SpillError::Write {
                destination: destination.to_path_buf(),
                source: std::io::Error::other("disk full"),
            })
        }
    }

    fn cache_with_capacity(capacity: usize) -> (SpillCache<u32, String>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let cache = SpillCache::new(&CacheConfig { capacity }, sink.clone());
        (cache, sink)
    }

    fn opaque(text: &str) -> CacheValue<String> {
        CacheValue::Opaque(text.to_string())
    }

    fn pair(handle: &str, destination: &str) -> CacheValue<String> {
        CacheValue::Persistable {
            handle: handle.to_string(),
            destination: PathBuf::from(destination),
        }
    }

    fn stack_keys(cache: &SpillCache<u32, String>) -> Vec<u32> {
        cache.stack().into_iter().map(|(key, _, _)| key).collect()
    }

    #[test]
    fn read_touch_moves_entry_to_the_tail() {
        let (cache, _) = cache_with_capacity(10);
        for i in 0..3 {
            cache.add(i, opaque("held")).expect("add");
        }

        cache.read(&0);

        assert_eq!(stack_keys(&cache), vec![1, 2, 0]);
    }

    #[test]
    fn read_of_absent_key_mutates_nothing() {
        let (cache, _) = cache_with_capacity(10);
        cache.add(0, opaque("held")).expect("add");

        assert!(cache.read(&7).is_none());

        let stack = cache.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].2, 0);
    }

    #[test]
    fn overwrite_refreshes_the_stamp() {
        let (cache, _) = cache_with_capacity(10);
        cache.add(0, opaque("first")).expect("add");
        cache.add(1, opaque("held")).expect("add");
        cache.add(0, opaque("second")).expect("add");

        assert_eq!(stack_keys(&cache), vec![1, 0]);
        assert_eq!(cache.read(&0), Some(opaque("second")));
    }

    #[test]
    fn stack_carries_values_and_stamps() {
        let (cache, _) = cache_with_capacity(10);
        cache.add(5, pair("net-5", "./bin/net-5.json")).expect("add");
        cache.add(6, opaque("scratch")).expect("add");

        let stack = cache.stack();
        assert_eq!(
            stack,
            vec![
                (5, pair("net-5", "./bin/net-5.json"), 0),
                (6, opaque("scratch"), 1),
            ]
        );
    }

    #[test]
    fn keys_returns_a_snapshot_without_mutation() {
        let (cache, _) = cache_with_capacity(10);
        for i in 0..4 {
            cache.add(i, opaque("held")).expect("add");
        }

        let mut keys = cache.keys();
        keys.sort_unstable();

        assert_eq!(keys, vec![0, 1, 2, 3]);
        assert_eq!(stack_keys(&cache), vec![0, 1, 2, 3]);
    }

    #[test]
    fn eviction_victim_is_always_the_minimum_stamp() {
        let (cache, _) = cache_with_capacity(3);
        for i in 0..3 {
            cache.add(i, opaque("held")).expect("add");
        }
        cache.read(&0);

        cache.add(3, opaque("held")).expect("add");

        // Key 1 holds the minimum stamp after the touch of key 0.
        assert_eq!(stack_keys(&cache), vec![2, 0, 3]);
    }

    #[test]
    fn eviction_spills_persistable_pairs_in_order() {
        let (cache, sink) = cache_with_capacity(2);
        for i in 0..4 {
            cache
                .add(i, pair(&format!("net-{i}"), &format!("./bin/net-{i}.json")))
                .expect("add");
        }

        assert_eq!(stack_keys(&cache), vec![2, 3]);
        assert_eq!(
            sink.calls(),
            vec![
                ("net-0".to_string(), PathBuf::from("./bin/net-0.json")),
                ("net-1".to_string(), PathBuf::from("./bin/net-1.json")),
            ]
        );
    }

    #[test]
    fn evicted_opaque_values_never_reach_the_sink() {
        let (cache, sink) = cache_with_capacity(1);
        cache.add(1, opaque("plain string")).expect("add");
        cache.add(2, opaque("evicts key 1")).expect("add");

        assert_eq!(stack_keys(&cache), vec![2]);
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn popped_pair_reaches_the_sink_exactly_once() {
        let (cache, sink) = cache_with_capacity(10);
        cache.add(3, pair("net-3", "./bin/net-3.json")).expect("add");

        let popped = cache.pop(&3).expect("pop");

        assert_eq!(popped, Some(pair("net-3", "./bin/net-3.json")));
        assert_eq!(
            sink.calls(),
            vec![("net-3".to_string(), PathBuf::from("./bin/net-3.json"))]
        );

        assert_eq!(cache.pop(&3).expect("pop"), None);
        assert_eq!(sink.calls().len(), 1);
    }

    #[test]
    fn pop_of_absent_key_is_a_noop() {
        let (cache, sink) = cache_with_capacity(10);
        cache.add(0, opaque("held")).expect("add");

        assert_eq!(cache.pop(&9).expect("pop"), None);
        assert_eq!(cache.len(), 1);
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn flush_spills_pairs_and_drops_opaque_values() {
        let (cache, sink) = cache_with_capacity(10);
        cache.add(0, pair("net-0", "./bin/net-0.json")).expect("add");
        cache.add(1, opaque("scratch")).expect("add");
        cache.add(2, pair("net-2", "./bin/net-2.json")).expect("add");

        cache.flush().expect("flush");

        assert!(cache.is_empty());
        assert_eq!(
            sink.calls(),
            vec![
                ("net-0".to_string(), PathBuf::from("./bin/net-0.json")),
                ("net-2".to_string(), PathBuf::from("./bin/net-2.json")),
            ]
        );
    }

    #[test]
    fn flush_rearms_the_clock_to_zero() {
        let (cache, _) = cache_with_capacity(10);
        for i in 0..5 {
            cache.add(i, opaque("held")).expect("add");
        }

        cache.flush().expect("flush");
        cache.add(0, opaque("fresh")).expect("add");

        let stack = cache.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].2, 0);
    }

    #[test]
    fn sink_failure_propagates_from_add_with_victim_removed() {
        let cache: SpillCache<u32, String> =
            SpillCache::new(&CacheConfig { capacity: 1 }, Arc::new(FailingSink));
        cache.add(0, pair("net-0", "./bin/net-0.json")).expect("add");

        let result = cache.add(1, opaque("evicts key 0"));

        assert!(matches!(result, Err(SpillError::Write { .. })));
        assert_eq!(stack_keys(&cache), vec![1]);
    }

    #[test]
    fn sink_failure_propagates_from_pop() {
        let cache: SpillCache<u32, String> =
            SpillCache::new(&CacheConfig { capacity: 10 }, Arc::new(FailingSink));
        cache.add(0, pair("net-0", "./bin/net-0.json")).expect("add");

        assert!(cache.pop(&0).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn sink_failure_propagates_from_flush() {
        let cache: SpillCache<u32, String> =
            SpillCache::new(&CacheConfig { capacity: 10 }, Arc::new(FailingSink));
        cache.add(0, pair("net-0", "./bin/net-0.json")).expect("add");

        assert!(cache.flush().is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_config_is_clamped_to_one() {
        let (cache, _) = cache_with_capacity(0);
        cache.add(0, opaque("held")).expect("add");
        cache.add(1, opaque("held")).expect("add");

        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let (cache, _) = cache_with_capacity(10);
        cache.add(0, opaque("held")).expect("add");

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache
                .inner
                .lock()
                .expect("inner lock should be acquired");
            panic!("poison holding-cache lock");
        }));

        cache.add(1, opaque("after poison")).expect("add");
        assert_eq!(cache.len(), 2);
    }
}
