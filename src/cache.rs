//! Caches keyed on creation info.
//!
//! [`Cache`] is the long-lived LRU used for pipelines, render passes,
//! framebuffers, samplers and descriptor-set layouts: a shared lock on the
//! hit path, an exclusive lock only to create, and frame-based eviction.
//!
//! [`PerFrameCache`] serves values whose lifetime is one frame slot
//! (descriptor sets). Lookups that miss append into a per-thread buffer so
//! recording threads never contend; the buffers are merged into the main map
//! under the exclusive lock when the frame is collected.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use fxhash::FxHashMap;

use crate::error::Result;

struct LruEntry<V> {
    value: V,
    last_use_frame: AtomicU64,
}

pub struct Cache<K: Eq + Hash + Clone, V: Clone> {
    map: RwLock<FxHashMap<K, LruEntry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new() -> Cache<K, V> {
        Cache {
            map: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn acquire(
        &self,
        ci: &K,
        current_frame: u64,
        create: impl FnOnce(&K) -> Result<V>,
    ) -> Result<V> {
        {
            let map = self.map.read().unwrap();
            if let Some(e) = map.get(ci) {
                e.last_use_frame.store(current_frame, Ordering::Relaxed);
                return Ok(e.value.clone());
            }
        }
        let mut map = self.map.write().unwrap();
        // somebody else may have created it between the locks
        if let Some(e) = map.get(ci) {
            e.last_use_frame.store(current_frame, Ordering::Relaxed);
            return Ok(e.value.clone());
        }
        let value = create(ci)?;
        map.insert(
            ci.clone(),
            LruEntry {
                value: value.clone(),
                last_use_frame: AtomicU64::new(current_frame),
            },
        );
        Ok(value)
    }

    /// Destroy every entry not used within `threshold` frames.
    pub fn collect(&self, current_frame: u64, threshold: u64, mut destroy: impl FnMut(V)) {
        let mut map = self.map.write().unwrap();
        map.retain(|_, e| {
            let last = e.last_use_frame.load(Ordering::Relaxed);
            if current_frame.saturating_sub(last) > threshold {
                destroy(e.value.clone());
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&self, mut destroy: impl FnMut(V)) {
        let mut map = self.map.write().unwrap();
        for (_, e) in map.drain() {
            destroy(e.value);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

//--------------------------------------------------------------------------------------------------

struct ThreadAppend<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

struct PerFrameEntry<V> {
    value: V,
    last_use_frame: AtomicU64,
}

pub struct PerFrameCache<K: Eq + Hash + Clone, V: Clone> {
    map: RwLock<FxHashMap<K, PerFrameEntry<V>>>,
    per_thread: Vec<Mutex<ThreadAppend<K, V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> PerFrameCache<K, V> {
    pub fn new(max_threads: usize) -> PerFrameCache<K, V> {
        PerFrameCache {
            map: RwLock::new(FxHashMap::default()),
            per_thread: (0..max_threads)
                .map(|_| {
                    Mutex::new(ThreadAppend {
                        keys: Vec::new(),
                        values: Vec::new(),
                    })
                })
                .collect(),
        }
    }

    /// Look up or create from thread `tid`. The per-thread buffer is only
    /// ever touched by its owning thread during recording, so the inner lock
    /// is uncontended.
    pub fn acquire(
        &self,
        ci: &K,
        current_frame: u64,
        tid: usize,
        create: impl FnOnce(&K) -> Result<V>,
    ) -> Result<V> {
        {
            let map = self.map.read().unwrap();
            if let Some(e) = map.get(ci) {
                e.last_use_frame.store(current_frame, Ordering::Relaxed);
                return Ok(e.value.clone());
            }
        }
        let mut tb = self.per_thread[tid].lock().unwrap();
        if let Some(pos) = tb.keys.iter().position(|k| k == ci) {
            return Ok(tb.values[pos].clone());
        }
        let value = create(ci)?;
        tb.keys.push(ci.clone());
        tb.values.push(value.clone());
        Ok(value)
    }

    /// Evict stale entries, then merge the per-thread buffers into the map.
    /// Values that raced into more than one buffer are deduplicated; the
    /// losers are destroyed.
    pub fn collect(&self, current_frame: u64, threshold: u64, mut destroy: impl FnMut(V)) {
        let mut map = self.map.write().unwrap();
        map.retain(|_, e| {
            let last = e.last_use_frame.load(Ordering::Relaxed);
            if current_frame.saturating_sub(last) > threshold {
                destroy(e.value.clone());
                false
            } else {
                true
            }
        });

        for tb in &self.per_thread {
            let mut tb = tb.lock().unwrap();
            let keys = std::mem::replace(&mut tb.keys, Vec::new());
            let values = std::mem::replace(&mut tb.values, Vec::new());
            for (k, v) in keys.into_iter().zip(values) {
                if map.contains_key(&k) {
                    destroy(v);
                } else {
                    map.insert(
                        k,
                        PerFrameEntry {
                            value: v,
                            last_use_frame: AtomicU64::new(current_frame),
                        },
                    );
                }
            }
        }
    }

    pub fn clear(&self, mut destroy: impl FnMut(V)) {
        let mut map = self.map.write().unwrap();
        for (_, e) in map.drain() {
            destroy(e.value);
        }
        for tb in &self.per_thread {
            let mut tb = tb.lock().unwrap();
            tb.keys.clear();
            for v in tb.values.drain(..) {
                destroy(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn acquire_creates_once_and_collect_evicts() {
        let cache: Cache<u32, u64> = Cache::new();
        let created = AtomicUsize::new(0);
        let make = |_: &u32| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        };
        assert_eq!(cache.acquire(&1, 0, make).unwrap(), 99);
        assert_eq!(cache.acquire(&1, 5, make).unwrap(), 99);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let mut destroyed = Vec::new();
        cache.collect(10, 2, |v| destroyed.push(v));
        // last use was frame 5, 10 - 5 > 2 -> evicted
        assert_eq!(destroyed, vec![99]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn per_frame_cache_merges_thread_buffers_at_collect() {
        let cache: PerFrameCache<u32, u64> = PerFrameCache::new(2);
        // two threads race to create the same key
        assert_eq!(cache.acquire(&7, 0, 0, |_| Ok(100)).unwrap(), 100);
        assert_eq!(cache.acquire(&7, 0, 1, |_| Ok(200)).unwrap(), 200);

        let mut destroyed = Vec::new();
        cache.collect(1, 4, |v| destroyed.push(v));
        // one of the duplicates lost the merge and was destroyed
        assert_eq!(destroyed.len(), 1);

        // after the merge the map serves the surviving value to everyone
        let a = cache.acquire(&7, 1, 0, |_| panic!("must hit")).unwrap();
        let b = cache.acquire(&7, 1, 1, |_| panic!("must hit")).unwrap();
        assert_eq!(a, b);
    }
}
