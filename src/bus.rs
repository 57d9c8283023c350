//! Invalidation bus.
//!
//! Turns "this data changed" signals into cache work: every invalidation
//! marks the matching entries stale and re-resolves the ones something is
//! actively watching. Keys matched by several scopes of the same
//! invalidation are still re-resolved only once.
//!
//! Scopes are prefixes, so invalidating `movimientos` also covers every
//! `movimientos/<banco>` entry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::key::{KeyScope, QueryKey};
use crate::query::QueryEngine;
use crate::store::CacheStore;

const METRIC_INVALIDATION_TOTAL: &str = "refresco_bus_invalidation_total";

/// One processed invalidation signal.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub id: Uuid,
    /// Monotonic per-bus sequence number.
    pub epoch: u64,
    pub scope: KeyScope,
    pub timestamp: OffsetDateTime,
    /// How many entries the scope marked stale.
    pub marked: usize,
}

pub struct InvalidationBus {
    store: Arc<CacheStore>,
    query: Arc<QueryEngine>,
    epoch: AtomicU64,
}

impl InvalidationBus {
    pub fn new(store: Arc<CacheStore>, query: Arc<QueryEngine>) -> Self {
        Self {
            store,
            query,
            epoch: AtomicU64::new(0),
        }
    }

    /// Invalidate each key as a prefix scope, then re-resolve every watched
    /// key the scopes cover, each at most once.
    ///
    /// Completes after the re-resolutions settle, so a caller that awaits
    /// this observes reconciled state.
    pub async fn invalidate(&self, keys: &[QueryKey]) -> Vec<InvalidationEvent> {
        let scopes: Vec<KeyScope> = keys.iter().cloned().map(KeyScope::Prefix).collect();
        self.process(scopes).await
    }

    /// Invalidate the entire store.
    pub async fn invalidate_all(&self) -> Vec<InvalidationEvent> {
        self.process(vec![KeyScope::All]).await
    }

    async fn process(&self, scopes: Vec<KeyScope>) -> Vec<InvalidationEvent> {
        let mut events = Vec::with_capacity(scopes.len());
        let mut watched: BTreeSet<QueryKey> = BTreeSet::new();

        for scope in scopes {
            let marked = self.store.mark_stale(&scope);
            watched.extend(self.store.keys_with_subscribers(&scope));

            let event = InvalidationEvent {
                id: Uuid::new_v4(),
                epoch: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
                scope,
                timestamp: OffsetDateTime::now_utc(),
                marked,
            };
            counter!(METRIC_INVALIDATION_TOTAL).increment(1);
            info!(
                event_id = %event.id,
                epoch = event.epoch,
                scope = %event.scope,
                marked = event.marked,
                "invalidation processed"
            );
            events.push(event);
        }

        let refetches = watched
            .into_iter()
            .map(|key| {
                let query = Arc::clone(&self.query);
                async move {
                    if let Some(Err(error)) = query.refresh(&key, false).await {
                        debug!(key = %key, %error, "refetch after invalidation failed");
                    }
                }
            })
            .collect::<Vec<_>>();
        join_all(refetches).await;

        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    use serde_json::{Value, json};

    use super::*;
    use crate::config::CacheConfig;
    use crate::entry::{CacheEntry, EntryStatus};
    use crate::fetcher::{Fetcher, FnFetcher};
    use crate::key::namespace;
    use crate::query::QueryOptions;

    struct Fixture {
        store: Arc<CacheStore>,
        query: Arc<QueryEngine>,
        bus: InvalidationBus,
    }

    fn fixture() -> Fixture {
        let config = CacheConfig::default();
        let store = Arc::new(CacheStore::new(&config));
        let query = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            config.default_stale_time(),
        ));
        let bus = InvalidationBus::new(Arc::clone(&store), Arc::clone(&query));
        Fixture { store, query, bus }
    }

    fn sequenced_fetcher(calls: Arc<AtomicUsize>) -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new(move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "version": n }))
            }
        }))
    }

    #[tokio::test]
    async fn watched_key_is_refetched_exactly_once() {
        let fx = fixture();
        let key = namespace::ventas();

        let seen: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _guard = fx.store.subscribe(
            key.clone(),
            Arc::new(move |entry: &CacheEntry| {
                if let Some(value) = entry.value.as_deref() {
                    sink.lock().expect("seen lock").push(value.clone());
                }
            }),
        );

        let calls = Arc::new(AtomicUsize::new(0));
        fx.query
            .resolve(&key, sequenced_fetcher(Arc::clone(&calls)), QueryOptions::default())
            .await
            .expect("seed resolve");

        // One invalidation naming the key twice via overlapping scopes.
        fx.bus
            .invalidate(&[key.clone(), namespace::ventas()])
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            seen.lock().expect("seen lock").as_slice(),
            &[json!({ "version": 1 }), json!({ "version": 2 })]
        );
    }

    #[tokio::test]
    async fn unwatched_keys_are_marked_stale_but_not_fetched() {
        let fx = fixture();
        let key = namespace::productos();

        let calls = Arc::new(AtomicUsize::new(0));
        fx.query
            .resolve(&key, sequenced_fetcher(Arc::clone(&calls)), QueryOptions::default())
            .await
            .expect("seed resolve");

        fx.bus.invalidate(&[key.clone()]).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.get(&key).expect("entry").status, EntryStatus::Stale);
    }

    #[tokio::test]
    async fn prefix_scope_covers_descendants() {
        let fx = fixture();
        let b1 = namespace::movimientos_por_banco("b1");
        let b2 = namespace::movimientos_por_banco("b2");

        let calls = Arc::new(AtomicUsize::new(0));
        for key in [&b1, &b2] {
            fx.query
                .resolve(key, sequenced_fetcher(Arc::clone(&calls)), QueryOptions::default())
                .await
                .expect("seed resolve");
        }
        let _guard = fx
            .store
            .subscribe(b1.clone(), Arc::new(|_entry: &CacheEntry| {}));

        let events = fx.bus.invalidate(&[namespace::movimientos()]).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].marked, 2);
        // Only the watched descendant was refetched.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fx.store.get(&b2).expect("entry").status, EntryStatus::Stale);
        assert_eq!(fx.store.get(&b1).expect("entry").status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn epochs_are_monotonic() {
        let fx = fixture();
        let first = fx.bus.invalidate(&[namespace::bancos()]).await;
        let second = fx.bus.invalidate_all().await;
        assert!(second[0].epoch > first[0].epoch);
    }
}
