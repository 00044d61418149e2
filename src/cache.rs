//! Sharded concurrent key/value cache with optional per-entry expiry.
//!
//! Each cache is an owned value injected into the component that uses it,
//! never a process-wide static. Reads and writes on unrelated keys do not
//! contend on a shared lock.

use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

pub struct ConcurrentCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Option<Duration>,
    capacity: usize,
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache whose entries live until invalidated or evicted for space.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: None,
            capacity: capacity.max(1),
        }
    }

    /// Cache whose entries expire `ttl` after insertion unless overridden.
    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            default_ttl: Some(ttl),
            ..Self::new(capacity)
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn put(&self, key: K, value: V) {
        self.insert_entry(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.insert_entry(key, value, Some(ttl));
    }

    /// Insert `value` unless a live entry already exists; returns whichever
    /// value ends up cached.
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        let now = Instant::now();
        if !self.entries.contains_key(&key) {
            self.make_room(now);
        }
        let expires_at = self.default_ttl.map(|ttl| now + ttl);
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| CacheEntry {
                value: value.clone(),
                expires_at,
            });
        if entry.is_expired(now) {
            *entry = CacheEntry { value, expires_at };
        }
        entry.value.clone()
    }

    pub fn invalidate<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Keep only entries for which `f` returns true; returns how many were removed.
    pub fn retain(&self, mut f: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, e| f(k, &e.value));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_entry(&self, key: K, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        if !self.entries.contains_key(&key) {
            self.make_room(now);
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }

    // Soft bound: drop expired entries first, then an arbitrary one.
    fn make_room(&self, now: Instant) {
        if self.entries.len() < self.capacity {
            return;
        }
        self.entries.retain(|_, e| !e.is_expired(now));
        if self.entries.len() < self.capacity {
            return;
        }
        let victim = self.entries.iter().next().map(|e| e.key().clone());
        if let Some(victim) = victim {
            self.entries.remove(&victim);
        }
    }
}
