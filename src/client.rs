//! Client facade.
//!
//! One [`CacheClient`] per application instance owns the store and the
//! engines around it; construct a fresh one per test for isolation. The
//! facade only wires and delegates, so anything needing finer control can
//! reach the underlying components through the accessors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::{InvalidationBus, InvalidationEvent};
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{MutationError, QueryError};
use crate::fetcher::{Fetcher, Mutator};
use crate::key::{QueryKey, namespace};
use crate::mutation::{MutationConfig, MutationEngine, MutationReceipt};
use crate::polling::{PollingHandle, PollingScheduler};
use crate::query::{QueryEngine, QueryOptions};
use crate::store::{CacheStore, Subscription, WatchCallback};

pub struct CacheClient {
    config: CacheConfig,
    store: Arc<CacheStore>,
    query: Arc<QueryEngine>,
    bus: Arc<InvalidationBus>,
    mutations: MutationEngine,
    polling: PollingScheduler,
}

impl CacheClient {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(CacheStore::new(&config));
        let query = Arc::new(QueryEngine::new(
            Arc::clone(&store),
            config.default_stale_time(),
        ));
        let bus = Arc::new(InvalidationBus::new(
            Arc::clone(&store),
            Arc::clone(&query),
        ));
        let mutations = MutationEngine::new(Arc::clone(&store), Arc::clone(&bus));
        let polling = PollingScheduler::new(
            Arc::clone(&store),
            Arc::clone(&query),
            config.min_poll_interval(),
        );
        Self {
            config,
            store,
            query,
            bus,
            mutations,
            polling,
        }
    }

    /// Resolve a key, serving the cached value while it is fresh.
    pub async fn query(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> Result<Arc<Value>, QueryError> {
        self.query.resolve(key, fetcher, options).await
    }

    /// Register interest in a key; the callback fires on every change until
    /// the returned guard is dropped.
    pub fn watch(&self, key: QueryKey, callback: WatchCallback) -> Subscription {
        self.store.subscribe(key, callback)
    }

    /// Current state of a key without side effects.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.store.get(key)
    }

    /// Re-resolve a previously queried key; `force` bypasses freshness.
    pub async fn refresh(
        &self,
        key: &QueryKey,
        force: bool,
    ) -> Option<Result<Arc<Value>, QueryError>> {
        self.query.refresh(key, force).await
    }

    /// Run an optimistic mutation to settlement.
    pub async fn mutate(
        &self,
        mutator: Arc<dyn Mutator>,
        variables: Value,
        config: &MutationConfig,
    ) -> Result<MutationReceipt, MutationError> {
        self.mutations.mutate(mutator, variables, config).await
    }

    pub fn start_polling(&self, key: QueryKey, interval: Duration) -> PollingHandle {
        self.polling.start_polling(key, interval)
    }

    pub async fn invalidate(&self, keys: &[QueryKey]) -> Vec<InvalidationEvent> {
        self.bus.invalidate(keys).await
    }

    /// Invalidate a resource together with every cached view derived from
    /// it, per the dashboard key namespace.
    pub async fn invalidate_related(&self, resource: &QueryKey) -> Vec<InvalidationEvent> {
        self.bus
            .invalidate(&namespace::related_keys(resource))
            .await
    }

    pub async fn invalidate_all(&self) -> Vec<InvalidationEvent> {
        self.bus.invalidate_all().await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn query_engine(&self) -> &Arc<QueryEngine> {
        &self.query
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }
}
