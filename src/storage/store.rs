//! The key-value store.
//!
//! A plain `HashMap` with per-entry expiry. There are no locks in here: the
//! store has exactly one owner, the command synchronizer's worker thread, and
//! every access is a `&mut Store` handed to a command. Expired entries are
//! evicted lazily when a read touches them and in bulk by
//! [`Store::purge_expired`], which the expiry sweeper schedules.

use crate::storage::clock::{Clock, SystemClock};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A stored value with its optional expiry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The actual value stored
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<SystemTime>,
}

impl Entry {
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    pub fn with_expiry(value: Bytes, expires_at: SystemTime) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }

    /// An entry is live until strictly after its expiry time.
    #[inline]
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(true, |exp| exp >= now)
    }
}

/// A point-in-time copy of every live entry.
pub type Snapshot = HashMap<Bytes, Entry>;

/// What a write does to the key's existing expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetExpiry {
    /// Drop any existing expiry
    Clear,
    /// Keep the expiry of the live entry being overwritten
    Keep,
    /// Expire at the given time
    At(SystemTime),
}

/// The key-value map owned by the command synchronizer.
#[derive(Debug)]
pub struct Store {
    entries: HashMap<Bytes, Entry>,
    clock: Arc<dyn Clock>,
    /// Keys removed because their expiry passed
    expired_keys: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            clock,
            expired_keys: 0,
        }
    }

    /// Builds a store from a snapshot, dropping entries that are already expired.
    pub fn from_snapshot(snapshot: Snapshot, clock: Arc<dyn Clock>) -> Self {
        let mut store = Self::new(clock);
        store.replace(snapshot);
        store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Looks up a live entry, evicting it if it has expired.
    pub fn entry(&mut self, key: &[u8]) -> Option<&Entry> {
        let now = self.clock.now();
        match self.entries.get(key).map(|entry| entry.is_live(now)) {
            Some(true) => self.entries.get(key),
            Some(false) => {
                self.entries.remove(key);
                self.expired_keys += 1;
                None
            }
            None => None,
        }
    }

    /// Returns the value of a live key.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        self.entry(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&mut self, key: &[u8]) -> bool {
        self.entry(key).is_some()
    }

    /// Writes a value.
    pub fn set(&mut self, key: Bytes, value: Bytes, expiry: SetExpiry) {
        let expires_at = match expiry {
            SetExpiry::Clear => None,
            SetExpiry::At(at) => Some(at),
            SetExpiry::Keep => self.entry(&key).and_then(|entry| entry.expires_at),
        };
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Removes a key. Returns true only if a live entry was removed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let now = self.clock.now();
        match self.entries.remove(key) {
            Some(entry) if entry.is_live(now) => true,
            Some(_) => {
                self.expired_keys += 1;
                false
            }
            None => false,
        }
    }

    /// Expiry of a live key: `None` if the key is missing, `Some(None)` if it
    /// never expires.
    pub fn expiry(&mut self, key: &[u8]) -> Option<Option<SystemTime>> {
        self.entry(key).map(|entry| entry.expires_at)
    }

    /// Time left before a live key expires.
    pub fn time_to_live(&mut self, key: &[u8]) -> Option<Option<Duration>> {
        let now = self.clock.now();
        self.expiry(key).map(|expiry| {
            expiry.map(|at| at.duration_since(now).unwrap_or(Duration::ZERO))
        })
    }

    /// Sets or clears the expiry of a live key. Returns false if the key is missing.
    pub fn set_expiry(&mut self, key: &[u8], expires_at: Option<SystemTime>) -> bool {
        if !self.contains(key) {
            return false;
        }
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    /// Live keys, in no particular order.
    pub fn keys(&self) -> Vec<Bytes> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored entries that carry an expiry.
    pub fn volatile_len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.expires_at.is_some())
            .count()
    }

    pub fn expired_keys(&self) -> u64 {
        self.expired_keys
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before - self.entries.len();
        self.expired_keys += removed as u64;
        removed
    }

    /// Copies every live entry.
    pub fn snapshot(&self) -> Snapshot {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Replaces the whole keyspace with `snapshot`, skipping expired entries.
    pub fn replace(&mut self, mut snapshot: Snapshot) {
        let now = self.clock.now();
        snapshot.retain(|_, entry| entry.is_live(now));
        self.entries = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::clock::ManualClock;

    fn store_with_clock() -> (Store, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (Store::new(clock.clone()), clock)
    }

    fn key(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[test]
    fn test_set_and_get() {
        let (mut store, _) = store_with_clock();
        store.set(key("name"), key("Ariz"), SetExpiry::Clear);
        assert_eq!(store.get(b"name"), Some(key("Ariz")));
        assert_eq!(store.get(b"missing"), None);
    }

    #[test]
    fn test_lazy_eviction_on_get() {
        let (mut store, clock) = store_with_clock();
        let at = clock.now() + Duration::from_millis(10);
        store.set(key("k"), key("v"), SetExpiry::At(at));

        clock.advance(Duration::from_millis(5));
        assert_eq!(store.get(b"k"), Some(key("v")));

        // Live through the exact expiry instant
        clock.advance(Duration::from_millis(5));
        assert_eq!(store.get(b"k"), Some(key("v")));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get(b"k"), None);
        assert_eq!(store.len(), 0);
        assert_eq!(store.expired_keys(), 1);
    }

    #[test]
    fn test_keep_expiry() {
        let (mut store, clock) = store_with_clock();
        let at = clock.now() + Duration::from_secs(60);
        store.set(key("k"), key("v1"), SetExpiry::At(at));
        store.set(key("k"), key("v2"), SetExpiry::Keep);
        assert_eq!(store.expiry(b"k"), Some(Some(at)));

        store.set(key("k"), key("v3"), SetExpiry::Clear);
        assert_eq!(store.expiry(b"k"), Some(None));
    }

    #[test]
    fn test_keep_expiry_of_expired_entry_is_dropped() {
        let (mut store, clock) = store_with_clock();
        let at = clock.now() + Duration::from_millis(1);
        store.set(key("k"), key("v1"), SetExpiry::At(at));
        clock.advance(Duration::from_millis(2));

        store.set(key("k"), key("v2"), SetExpiry::Keep);
        assert_eq!(store.expiry(b"k"), Some(None));
        assert_eq!(store.get(b"k"), Some(key("v2")));
    }

    #[test]
    fn test_remove_counts_only_live() {
        let (mut store, clock) = store_with_clock();
        store.set(key("a"), key("1"), SetExpiry::Clear);
        store.set(
            key("b"),
            key("2"),
            SetExpiry::At(clock.now() + Duration::from_millis(1)),
        );
        clock.advance(Duration::from_millis(2));

        assert!(store.remove(b"a"));
        assert!(!store.remove(b"b"));
        assert!(!store.remove(b"c"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_time_to_live() {
        let (mut store, clock) = store_with_clock();
        store.set(
            key("k"),
            key("v"),
            SetExpiry::At(clock.now() + Duration::from_millis(1500)),
        );
        store.set(key("p"), key("v"), SetExpiry::Clear);

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.time_to_live(b"k"), Some(Some(Duration::from_millis(1000))));
        assert_eq!(store.time_to_live(b"p"), Some(None));
        assert_eq!(store.time_to_live(b"missing"), None);
    }

    #[test]
    fn test_set_expiry() {
        let (mut store, clock) = store_with_clock();
        assert!(!store.set_expiry(b"k", None));

        store.set(key("k"), key("v"), SetExpiry::Clear);
        let at = clock.now() + Duration::from_secs(1);
        assert!(store.set_expiry(b"k", Some(at)));
        assert_eq!(store.expiry(b"k"), Some(Some(at)));
        assert_eq!(store.volatile_len(), 1);
    }

    #[test]
    fn test_keys_skips_expired() {
        let (mut store, clock) = store_with_clock();
        store.set(key("live"), key("v"), SetExpiry::Clear);
        store.set(
            key("dead"),
            key("v"),
            SetExpiry::At(clock.now() + Duration::from_millis(1)),
        );
        clock.advance(Duration::from_millis(2));

        assert_eq!(store.keys(), vec![key("live")]);
    }

    #[test]
    fn test_purge_expired() {
        let (mut store, clock) = store_with_clock();
        for i in 0..10 {
            store.set(
                key(&format!("key{}", i)),
                key("value"),
                SetExpiry::At(clock.now() + Duration::from_millis(10)),
            );
        }
        store.set(key("persistent"), key("value"), SetExpiry::Clear);

        assert_eq!(store.purge_expired(), 0);
        clock.advance(Duration::from_millis(11));
        assert_eq!(store.purge_expired(), 10);
        assert_eq!(store.len(), 1);
        assert!(store.contains(b"persistent"));
    }

    #[test]
    fn test_snapshot_and_replace() {
        let (mut store, clock) = store_with_clock();
        store.set(key("a"), key("1"), SetExpiry::Clear);
        store.set(
            key("b"),
            key("2"),
            SetExpiry::At(clock.now() + Duration::from_millis(1)),
        );
        clock.advance(Duration::from_millis(2));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&key("a")), Some(&Entry::new(key("1"))));

        let (mut other, _) = store_with_clock();
        other.set(key("old"), key("x"), SetExpiry::Clear);
        other.replace(snapshot);
        assert_eq!(other.keys(), vec![key("a")]);
    }
}
