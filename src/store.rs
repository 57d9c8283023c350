//! Keyed cache store.
//!
//! Single source of truth for last-known values and their freshness state.
//! All mutation goes through [`CacheStore::set`], [`CacheStore::set_error`],
//! [`CacheStore::mark_stale`] and [`CacheStore::restore`]; each of those
//! updates the entry and notifies its subscribers without suspending in
//! between, so no subscriber observes a torn intermediate state.
//!
//! Entries whose last subscriber goes away are parked in a bounded LRU pool
//! instead of being dropped outright; a remount within the grace window
//! revives the entry and skips the refetch storm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntrySnapshot, EntryStatus};
use crate::error::FetchError;
use crate::key::{KeyScope, QueryKey};
use crate::lock::{RecoverMutex, RecoverRwLock};

const METRIC_DETACHED_EVICT_TOTAL: &str = "refresco_store_detached_evict_total";

/// Callback invoked synchronously whenever the entry it watches changes.
pub type WatchCallback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: WatchCallback,
}

/// Live entry state plus its subscriber list, in subscription order.
struct Slot {
    value: Option<Arc<Value>>,
    status: EntryStatus,
    last_resolved_at: Option<Instant>,
    error: Option<Arc<FetchError>>,
    subscribers: Vec<Subscriber>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            value: None,
            status: EntryStatus::Idle,
            last_resolved_at: None,
            error: None,
            subscribers: Vec::new(),
        }
    }

    fn callbacks(&self) -> Vec<WatchCallback> {
        self.subscribers
            .iter()
            .map(|subscriber| Arc::clone(&subscriber.callback))
            .collect()
    }
}

/// Entry state parked after its last unsubscribe, awaiting revival.
struct DetachedEntry {
    value: Option<Arc<Value>>,
    status: EntryStatus,
    last_resolved_at: Option<Instant>,
    error: Option<Arc<FetchError>>,
}

pub struct CacheStore {
    entries: RwLock<HashMap<QueryKey, Slot>>,
    // Lock order is entries before detached, everywhere.
    detached: Mutex<LruCache<QueryKey, DetachedEntry>>,
    next_subscriber_id: AtomicU64,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            detached: Mutex::new(LruCache::new(config.detached_entry_limit_non_zero())),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Current state of a key, live or parked. No side effects.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let entries = self.entries.read_recovered("store.get");
        if let Some(slot) = entries.get(key) {
            return Some(Self::entry_of(key, slot));
        }
        drop(entries);

        let detached = self.detached.lock_recovered("store.get.detached");
        detached.peek(key).map(|parked| CacheEntry {
            key: key.clone(),
            value: parked.value.clone(),
            status: parked.status,
            last_resolved_at: parked.last_resolved_at,
            error: parked.error.clone(),
            subscriber_count: 0,
        })
    }

    /// Overwrite the value, mark it fresh and notify subscribers in
    /// subscription order. Returns the shared handle actually stored.
    pub fn set(&self, key: &QueryKey, value: Value) -> Arc<Value> {
        let stored = Arc::new(value);
        let (entry, callbacks) = {
            let mut entries = self.entries.write_recovered("store.set");
            let slot = self.slot_mut(&mut entries, key);
            slot.value = Some(Arc::clone(&stored));
            slot.status = EntryStatus::Fresh;
            slot.last_resolved_at = Some(Instant::now());
            slot.error = None;
            (Self::entry_of(key, slot), slot.callbacks())
        };
        Self::notify(&entry, &callbacks);
        stored
    }

    /// Record a failed resolution. The last good value is retained so
    /// consumers can keep showing it alongside the error.
    pub fn set_error(&self, key: &QueryKey, error: FetchError) -> Arc<FetchError> {
        let stored = Arc::new(error);
        let (entry, callbacks) = {
            let mut entries = self.entries.write_recovered("store.set_error");
            let slot = self.slot_mut(&mut entries, key);
            slot.status = EntryStatus::Error;
            slot.error = Some(Arc::clone(&stored));
            (Self::entry_of(key, slot), slot.callbacks())
        };
        Self::notify(&entry, &callbacks);
        stored
    }

    /// Mark matching entries stale, live and parked alike. Does not fetch
    /// and does not notify; re-resolution is the query engine's job.
    /// Returns how many entries were marked.
    pub fn mark_stale(&self, scope: &KeyScope) -> usize {
        let mut marked = 0;
        {
            let mut entries = self.entries.write_recovered("store.mark_stale");
            for (key, slot) in entries.iter_mut() {
                if scope.matches(key) {
                    slot.status = EntryStatus::Stale;
                    marked += 1;
                }
            }
        }
        {
            let mut detached = self.detached.lock_recovered("store.mark_stale.detached");
            for (key, parked) in detached.iter_mut() {
                if scope.matches(key) {
                    parked.status = EntryStatus::Stale;
                    marked += 1;
                }
            }
        }
        debug!(scope = %scope, marked, "entries marked stale");
        marked
    }

    /// Register a callback for a key. The returned guard unsubscribes on
    /// drop; losing the last subscriber parks the entry in the grace pool.
    pub fn subscribe(self: &Arc<Self>, key: QueryKey, callback: WatchCallback) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut entries = self.entries.write_recovered("store.subscribe");
            let slot = self.slot_mut(&mut entries, &key);
            slot.subscribers.push(Subscriber { id, callback });
        }
        Subscription {
            store: Arc::downgrade(self),
            key,
            id,
        }
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.get(key).map_or(0, |entry| entry.subscriber_count)
    }

    /// Keys inside `scope` with at least one active subscriber.
    pub fn keys_with_subscribers(&self, scope: &KeyScope) -> Vec<QueryKey> {
        let entries = self.entries.read_recovered("store.keys_with_subscribers");
        entries
            .iter()
            .filter(|(key, slot)| !slot.subscribers.is_empty() && scope.matches(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Deep copy of a key's state for mutation rollback.
    pub fn snapshot(&self, key: &QueryKey) -> EntrySnapshot {
        self.get(key).map_or_else(EntrySnapshot::absent, |entry| EntrySnapshot {
            value: entry.value.as_deref().cloned(),
            status: entry.status,
            last_resolved_at: entry.last_resolved_at,
            error: entry.error,
        })
    }

    /// Restore a key to a previously captured snapshot and notify
    /// subscribers. Used for mutation rollback.
    pub fn restore(&self, key: &QueryKey, snapshot: &EntrySnapshot) {
        let (entry, callbacks) = {
            let mut entries = self.entries.write_recovered("store.restore");
            let slot = self.slot_mut(&mut entries, key);
            slot.value = snapshot.value.clone().map(Arc::new);
            slot.status = snapshot.status;
            slot.last_resolved_at = snapshot.last_resolved_at;
            slot.error = snapshot.error.clone();
            (Self::entry_of(key, slot), slot.callbacks())
        };
        Self::notify(&entry, &callbacks);
    }

    /// Flag a key as having a fetch in flight. No notification; the settled
    /// result will notify.
    pub(crate) fn begin_fetch(&self, key: &QueryKey) {
        let mut entries = self.entries.write_recovered("store.begin_fetch");
        let slot = self.slot_mut(&mut entries, key);
        slot.status = EntryStatus::Fetching;
    }

    fn unsubscribe(&self, key: &QueryKey, id: u64) {
        let mut entries = self.entries.write_recovered("store.unsubscribe");
        let Some(slot) = entries.get_mut(key) else {
            return;
        };
        slot.subscribers.retain(|subscriber| subscriber.id != id);
        if !slot.subscribers.is_empty() {
            return;
        }

        // Last subscriber gone: park the entry for grace-period revival.
        let Some(slot) = entries.remove(key) else {
            return;
        };
        let mut detached = self.detached.lock_recovered("store.unsubscribe.detached");
        let evicted = detached.push(
            key.clone(),
            DetachedEntry {
                value: slot.value,
                status: slot.status,
                last_resolved_at: slot.last_resolved_at,
                error: slot.error,
            },
        );
        if let Some((evicted_key, _)) = evicted
            && evicted_key != *key
        {
            counter!(METRIC_DETACHED_EVICT_TOTAL).increment(1);
            debug!(key = %evicted_key, "detached entry evicted from grace pool");
        }
    }

    /// Live slot for a key, reviving a parked entry when one exists.
    fn slot_mut<'a>(
        &self,
        entries: &'a mut HashMap<QueryKey, Slot>,
        key: &QueryKey,
    ) -> &'a mut Slot {
        entries.entry(key.clone()).or_insert_with(|| {
            let mut detached = self.detached.lock_recovered("store.slot_mut.detached");
            detached.pop(key).map_or_else(Slot::empty, |parked| Slot {
                value: parked.value,
                status: parked.status,
                last_resolved_at: parked.last_resolved_at,
                error: parked.error,
                subscribers: Vec::new(),
            })
        })
    }

    fn entry_of(key: &QueryKey, slot: &Slot) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            value: slot.value.clone(),
            status: slot.status,
            last_resolved_at: slot.last_resolved_at,
            error: slot.error.clone(),
            subscriber_count: slot.subscribers.len(),
        }
    }

    fn notify(entry: &CacheEntry, callbacks: &[WatchCallback]) {
        for callback in callbacks {
            callback(entry);
        }
    }
}

/// Active interest in one key. Dropping it removes the callback and
/// decrements the key's subscriber count.
pub struct Subscription {
    store: Weak<CacheStore>,
    key: QueryKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Explicit disposal; equivalent to dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, self.id);
        }
    }
}
