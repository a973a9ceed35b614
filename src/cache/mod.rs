//! Shared response cache with time-based expiration.
//!
//! [`CacheStore`] maps a normalized request line to the raw bytes the backend
//! answered with. Entries are immutable once inserted; an entry older than the
//! configured expiration is evicted the next time it is looked up (lazy
//! eviction). [`spawn_sweeper`] optionally adds a periodic purge on top.
//!
//! Every operation takes the same lock, so lookups, inserts, deletes, clears
//! and listings are linearizable with respect to each other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::shutdown::Shutdown;

/// A cached backend response.
///
/// Cloning is cheap: the payload is a reference-counted [`Bytes`] buffer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    payload: Bytes,
    created_at: Instant,
}

impl CacheEntry {
    /// Returns the cache key this entry is stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the response bytes exactly as received from the backend.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the instant at which the entry was inserted.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns `true` if the entry is still within `expiration` at `now`.
    ///
    /// The boundary is inclusive: an entry exactly `expiration` old is fresh.
    pub fn is_fresh(&self, expiration: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) <= expiration
    }
}

/// Result of a [`CacheStore::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// The key is present and within its expiration window.
    Fresh(CacheEntry),
    /// The key was present but expired; it has been removed.
    Stale,
    /// The key is not in the store.
    Absent,
}

impl Lookup {
    /// Returns the entry on a fresh hit.
    pub fn fresh(self) -> Option<CacheEntry> {
        match self {
            Self::Fresh(entry) => Some(entry),
            Self::Stale | Self::Absent => None,
        }
    }
}

/// Thread-safe, insertion-ordered response cache.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cacheproxy::cache::{CacheStore, Lookup};
/// use tokio::time::Instant;
///
/// let cache = CacheStore::new(Duration::from_secs(60));
/// cache.insert("get / http/1.1", "HTTP/1.1 200 OK\r\n\r\n", Instant::now());
///
/// assert!(matches!(cache.lookup("get / http/1.1"), Lookup::Fresh(_)));
/// assert_eq!(cache.list_keys(), vec!["get / http/1.1".to_owned()]);
/// ```
#[derive(Debug)]
pub struct CacheStore {
    expiration: Duration,
    entries: Mutex<IndexMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Creates an empty store whose entries stay fresh for `expiration`.
    pub fn new(expiration: Duration) -> Self {
        Self {
            expiration,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Returns the freshness window applied to every entry.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Looks up `key` against the current time.
    pub fn lookup(&self, key: &str) -> Lookup {
        self.lookup_at(key, Instant::now())
    }

    /// Looks up `key` as of `now`, removing the entry if it has gone stale.
    pub fn lookup_at(&self, key: &str, now: Instant) -> Lookup {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None => Lookup::Absent,
            Some(entry) if entry.is_fresh(self.expiration, now) => Lookup::Fresh(entry.clone()),
            Some(_) => {
                entries.shift_remove(key);
                Lookup::Stale
            }
        }
    }

    /// Stores `payload` under `key`, replacing any existing entry.
    ///
    /// A replaced key keeps its original position in [`list_keys`](Self::list_keys).
    pub fn insert(&self, key: impl Into<String>, payload: impl Into<Bytes>, now: Instant) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload: payload.into(),
            created_at: now,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().shift_remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns a snapshot of the stored keys in insertion order.
    ///
    /// Stale entries that have not been looked up yet are still listed.
    pub fn list_keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Returns the number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every entry that is stale as of `now`, returning how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(self.expiration, now));
        before - entries.len()
    }
}

/// Spawns a task that purges stale entries every `every` until `shutdown` triggers.
///
/// Not used unless `cache.sweep_interval` is configured; the default is lazy
/// eviction on lookup only.
pub fn spawn_sweeper(cache: Arc<CacheStore>, every: Duration, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    let removed = cache.purge_expired(Instant::now());
                    if removed > 0 {
                        info!(removed, "swept expired cache entries");
                    }
                }
            }
        }
        debug!("cache sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> CacheStore {
        CacheStore::new(TTL)
    }

    #[test]
    fn absent_key() {
        let cache = store();
        assert!(matches!(cache.lookup("get / http/1.1"), Lookup::Absent));
    }

    #[test]
    fn fresh_hit_returns_payload_unchanged() {
        let cache = store();
        let now = Instant::now();
        cache.insert("get / http/1.1", "HTTP/1.1 200 OK\r\n\r\nhello", now);

        let entry = cache.lookup_at("get / http/1.1", now).fresh().unwrap();
        assert_eq!(entry.key(), "get / http/1.1");
        assert_eq!(&entry.payload()[..], b"HTTP/1.1 200 OK\r\n\r\nhello");
        assert_eq!(entry.created_at(), now);

        // A fresh hit has no side effect.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entry_at_exact_expiration_is_fresh() {
        let cache = store();
        let now = Instant::now();
        cache.insert("k", "v", now);
        assert!(matches!(cache.lookup_at("k", now + TTL), Lookup::Fresh(_)));
    }

    #[test]
    fn stale_lookup_evicts() {
        let cache = store();
        let now = Instant::now();
        cache.insert("k", "v", now);

        let later = now + TTL + Duration::from_millis(1);
        assert!(matches!(cache.lookup_at("k", later), Lookup::Stale));
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup_at("k", later), Lookup::Absent));
    }

    #[test]
    fn insert_overwrites_existing_entry() {
        let cache = store();
        let now = Instant::now();
        cache.insert("a", "first", now);
        cache.insert("b", "other", now);
        cache.insert("a", "second", now + Duration::from_secs(1));

        assert_eq!(cache.len(), 2);
        let entry = cache.lookup_at("a", now).fresh().unwrap();
        assert_eq!(&entry.payload()[..], b"second");
        assert_eq!(cache.list_keys(), vec!["a", "b"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = store();
        let now = Instant::now();
        cache.insert("a", "1", now);
        cache.insert("b", "2", now);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.list_keys(), vec!["b"]);
    }

    #[test]
    fn clear_removes_everything() {
        let cache = store();
        let now = Instant::now();
        cache.insert("a", "1", now);
        cache.insert("b", "2", now);

        cache.clear();
        assert!(cache.list_keys().is_empty());
        assert!(matches!(cache.lookup_at("a", now), Lookup::Absent));
    }

    #[test]
    fn list_keys_keeps_insertion_order() {
        let cache = store();
        let now = Instant::now();
        for key in ["c", "a", "b"] {
            cache.insert(key, "x", now);
        }
        cache.delete("a");
        cache.insert("d", "x", now);
        assert_eq!(cache.list_keys(), vec!["c", "b", "d"]);
    }

    #[test]
    fn purge_expired_keeps_fresh_entries() {
        let cache = store();
        let now = Instant::now();
        cache.insert("old", "1", now);
        cache.insert("new", "2", now + Duration::from_secs(30));

        let removed = cache.purge_expired(now + TTL + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(cache.list_keys(), vec!["new"]);
    }

    #[test]
    fn concurrent_distinct_keys_do_not_interfere() {
        let cache = Arc::new(store());
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let key = format!("get /{i}/{j} http/1.1");
                        cache.insert(key.clone(), format!("payload-{i}-{j}"), now);
                        assert!(matches!(cache.lookup_at(&key, now), Lookup::Fresh(_)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 16 * 50);
        let entry = cache.lookup_at("get /7/42 http/1.1", now).fresh().unwrap();
        assert_eq!(&entry.payload()[..], b"payload-7-42");
    }

    #[test]
    fn concurrent_same_key_leaves_one_whole_entry() {
        let cache = Arc::new(store());
        let now = Instant::now();
        let payloads: Vec<String> = (0..8).map(|i| format!("{i}").repeat(1024)).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cache.insert("get / http/1.1", payload.clone(), now);
                        let _ = cache.list_keys();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 1);
        let entry = cache.lookup_at("get / http/1.1", now).fresh().unwrap();
        let winner = String::from_utf8(entry.payload().to_vec()).unwrap();
        assert!(payloads.contains(&winner));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_until_shutdown() {
        let cache = Arc::new(CacheStore::new(Duration::from_secs(5)));
        cache.insert("k", "v", Instant::now());
        let shutdown = Shutdown::new();

        let sweeper = spawn_sweeper(Arc::clone(&cache), Duration::from_secs(1), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(cache.is_empty());

        shutdown.trigger();
        sweeper.await.unwrap();
    }
}
