//! Capacity-bounded TTL cache used to skip records that were already
//! scheduled in this or a recent run.
//!
//! A single `parking_lot::Mutex` guards the whole store. Expiry is lazy:
//! `get`/`exists` on an expired entry removes it and reports absence. When a
//! new key would push the store past `max_size`, the entry with the oldest
//! `created_at` is evicted first. Insertion order is kept in a `BTreeMap`
//! keyed by a monotonically increasing sequence number, so eviction does not
//! scan the map.

pub mod clock;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

pub use clock::{Clock, ManualClock, SystemClock};

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries held at once.
    pub max_size: usize,
    /// Entry lifetime. `Duration::ZERO` disables expiry.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000_000,
            ttl: Duration::from_secs(604_800),
        }
    }
}

struct Entry<V> {
    value: V,
    /// Insertion sequence; orders entries by creation time.
    seq: u64,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// seq -> key, oldest first.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Look up `key`, dropping it if expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry<V>> {
        if self.entries.get(key)?.is_expired(now) {
            self.remove(key);
            return None;
        }
        self.entries.get(key)
    }
}

/// The dedup cache. Cheap to share behind an `Arc`.
pub struct DedupCache<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> DedupCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            max_size = config.max_size,
            ttl_secs = config.ttl.as_secs(),
            "dedup cache initialized"
        );
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.live(key, now).map(|e| e.value.clone())
    }

    /// Insert or overwrite `key`. Overwriting refreshes its age.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key.into(), value, now);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.inner.lock().live(key, now).is_some()
    }

    /// Values for every key that is present. Missing keys are omitted.
    pub fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        keys.iter()
            .filter_map(|k| {
                let k = k.as_ref();
                inner.live(k, now).map(|e| (k.to_string(), e.value.clone()))
            })
            .collect()
    }

    pub fn set_many<I, K>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        for (k, v) in items {
            self.insert_locked(&mut inner, k.into(), v, now);
        }
    }

    pub fn contains_all<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        keys.iter().all(|k| inner.live(k.as_ref(), now).is_some())
    }

    pub fn contains_any<S: AsRef<str>>(&self, keys: &[S]) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        keys.iter().any(|k| inner.live(k.as_ref(), now).is_some())
    }

    /// The subsequence of `keys` that is present.
    pub fn filter_existing<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        self.partition(keys, true)
    }

    /// The subsequence of `keys` that is absent, in input order.
    pub fn filter_non_existing<S: AsRef<str>>(&self, keys: &[S]) -> Vec<String> {
        self.partition(keys, false)
    }

    /// Filter and mark in one critical section: every absent key is inserted
    /// with `value` and returned. Duplicates within `keys` are returned once.
    pub fn mark_scheduled<S: AsRef<str>>(&self, keys: &[S], value: V) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut fresh = Vec::new();
        for k in keys {
            let k = k.as_ref();
            if inner.live(k, now).is_some() {
                continue;
            }
            self.insert_locked(&mut inner, k.to_string(), value.clone(), now);
            fresh.push(k.to_string());
        }
        fresh
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Number of stored entries, including expired ones not yet touched.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn partition<S: AsRef<str>>(&self, keys: &[S], present: bool) -> Vec<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let k: &str = k.as_ref();
            if inner.live(k, now).is_some() == present {
                out.push(k.to_string());
            }
        }
        out
    }

    fn insert_locked(&self, inner: &mut Inner<V>, key: String, value: V, now: Instant) {
        if inner.remove(&key).is_none() {
            while self.config.max_size > 0 && inner.entries.len() >= self.config.max_size {
                match inner.evict_oldest() {
                    Some(evicted) => debug!(key = %evicted, "evicted oldest cache entry"),
                    None => break,
                }
            }
        }
        if self.config.max_size == 0 {
            return;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        // A TTL too large to represent never expires.
        let expires_at = if self.config.ttl.is_zero() {
            None
        } else {
            now.checked_add(self.config.ttl)
        };
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                seq,
                expires_at,
            },
        );
    }
}
