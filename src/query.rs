//! Query engine.
//!
//! Decides, per lookup, whether to serve the cached value, join a fetch
//! already in flight, or lead a new fetch. At most one fetch per key is ever
//! in flight; concurrent callers coalesce onto it through a watch channel
//! and all observe the same settled outcome.
//!
//! Fetch completions are sequence-guarded: a slow response that settles
//! after a newer one has already been applied is returned to its own caller
//! but never written back over the newer state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{FetchError, QueryError};
use crate::fetcher::Fetcher;
use crate::key::QueryKey;
use crate::lock::{RecoverMutex, RecoverRwLock};
use crate::store::CacheStore;

const METRIC_HIT_TOTAL: &str = "refresco_query_hit_total";
const METRIC_COALESCED_TOTAL: &str = "refresco_query_coalesced_total";
const METRIC_FETCH_TOTAL: &str = "refresco_query_fetch_total";
const METRIC_FETCH_DURATION_MS: &str = "refresco_query_fetch_duration_ms";

type FetchOutcome = Result<Arc<Value>, Arc<FetchError>>;

/// Per-call knobs for [`QueryEngine::resolve`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Freshness window override; `None` uses the engine-wide default.
    pub stale_time: Option<Duration>,
    /// Skip the freshness check and go to the data service, still
    /// coalescing onto an in-flight fetch if one exists.
    pub force: bool,
}

struct InFlight {
    seq: u64,
    rx: watch::Receiver<Option<FetchOutcome>>,
}

enum Plan {
    Hit(Arc<Value>),
    Join(watch::Receiver<Option<FetchOutcome>>),
    Lead {
        seq: u64,
        tx: watch::Sender<Option<FetchOutcome>>,
    },
}

pub struct QueryEngine {
    store: Arc<CacheStore>,
    default_stale_time: Duration,
    fetchers: RwLock<HashMap<QueryKey, Arc<dyn Fetcher>>>,
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    // Highest fetch sequence written back per key; older settles are
    // discarded instead of clobbering newer state.
    applied_seq: Mutex<HashMap<QueryKey, u64>>,
    next_seq: AtomicU64,
}

impl QueryEngine {
    pub fn new(store: Arc<CacheStore>, default_stale_time: Duration) -> Self {
        Self {
            store,
            default_stale_time,
            fetchers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            applied_seq: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Remember the fetcher for a key so invalidation and polling can
    /// re-resolve it without the original caller present. Last registration
    /// wins.
    pub fn register(&self, key: &QueryKey, fetcher: Arc<dyn Fetcher>) {
        let mut fetchers = self.fetchers.write_recovered("query.register");
        fetchers.insert(key.clone(), fetcher);
    }

    pub fn fetcher_for(&self, key: &QueryKey) -> Option<Arc<dyn Fetcher>> {
        let fetchers = self.fetchers.read_recovered("query.fetcher_for");
        fetchers.get(key).cloned()
    }

    /// Resolve a key to a value, registering `fetcher` for later refreshes.
    ///
    /// Serves the cached value when it is fresh, joins an in-flight fetch
    /// when one exists, and leads a new fetch otherwise.
    pub async fn resolve(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        options: QueryOptions,
    ) -> Result<Arc<Value>, QueryError> {
        self.register(key, Arc::clone(&fetcher));
        match self.plan(key, &options) {
            Plan::Hit(value) => {
                counter!(METRIC_HIT_TOTAL).increment(1);
                Ok(value)
            }
            Plan::Join(rx) => {
                counter!(METRIC_COALESCED_TOTAL).increment(1);
                self.join(key, rx).await
            }
            Plan::Lead { seq, tx } => {
                counter!(METRIC_FETCH_TOTAL).increment(1);
                self.lead(key, fetcher, seq, tx).await
            }
        }
    }

    /// Re-resolve a key with its registered fetcher, if any.
    ///
    /// Used by invalidation and polling, where no caller-supplied fetcher is
    /// at hand. Returns `None` for keys never queried.
    pub async fn refresh(
        &self,
        key: &QueryKey,
        force: bool,
    ) -> Option<Result<Arc<Value>, QueryError>> {
        let fetcher = self.fetcher_for(key)?;
        let options = QueryOptions {
            stale_time: None,
            force,
        };
        Some(self.resolve(key, fetcher, options).await)
    }

    fn plan(&self, key: &QueryKey, options: &QueryOptions) -> Plan {
        if !options.force
            && let Some(entry) = self.store.get(key)
            && entry.is_fresh_within(options.stale_time.unwrap_or(self.default_stale_time))
            && let Some(value) = entry.value
        {
            return Plan::Hit(value);
        }

        let mut in_flight = self.in_flight.lock_recovered("query.plan");
        if let Some(flight) = in_flight.get(key) {
            // A receiver erroring on has_changed means the leader dropped
            // its sender without settling; take over with a new fetch.
            if flight.rx.has_changed().is_ok() {
                return Plan::Join(flight.rx.clone());
            }
            debug!(key = %key, "replacing abandoned in-flight fetch");
            in_flight.remove(key);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.clone(), InFlight { seq, rx });
        drop(in_flight);

        self.store.begin_fetch(key);
        Plan::Lead { seq, tx }
    }

    async fn join(
        &self,
        key: &QueryKey,
        mut rx: watch::Receiver<Option<FetchOutcome>>,
    ) -> Result<Arc<Value>, QueryError> {
        loop {
            let settled = rx.borrow_and_update().clone();
            if let Some(outcome) = settled {
                return outcome.map_err(|source| QueryError::Fetch {
                    key: key.clone(),
                    source,
                });
            }
            if rx.changed().await.is_err() {
                self.forget_dead_flight(key);
                return Err(QueryError::Abandoned(key.clone()));
            }
        }
    }

    async fn lead(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn Fetcher>,
        seq: u64,
        tx: watch::Sender<Option<FetchOutcome>>,
    ) -> Result<Arc<Value>, QueryError> {
        let started = std::time::Instant::now();
        let result = fetcher.fetch(key).await;
        histogram!(METRIC_FETCH_DURATION_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        let outcome = self.settle(key, seq, result);
        // Joiners may all be gone; a closed channel is not an error here.
        let _ = tx.send(Some(outcome.clone()));

        outcome.map_err(|source| QueryError::Fetch {
            key: key.clone(),
            source,
        })
    }

    /// Write a fetch result back, unless a newer fetch already settled.
    ///
    /// The caller that awaited this specific fetch still receives its own
    /// outcome either way.
    fn settle(&self, key: &QueryKey, seq: u64, result: Result<Value, FetchError>) -> FetchOutcome {
        // Decide under the lock, write after it: subscriber callbacks fire
        // inside the store writes and must not run under engine locks.
        let apply = {
            let mut applied = self.applied_seq.lock_recovered("query.settle");
            let newest = applied.get(key).copied().unwrap_or(0);
            if seq < newest {
                warn!(key = %key, seq, newest, "discarding out-of-order fetch result");
                false
            } else {
                applied.insert(key.clone(), seq);
                true
            }
        };

        let outcome = if apply {
            match result {
                Ok(value) => Ok(self.store.set(key, value)),
                Err(error) => Err(self.store.set_error(key, error)),
            }
        } else {
            match result {
                Ok(value) => Ok(Arc::new(value)),
                Err(error) => Err(Arc::new(error)),
            }
        };

        let mut in_flight = self.in_flight.lock_recovered("query.settle.in_flight");
        if in_flight.get(key).is_some_and(|flight| flight.seq == seq) {
            in_flight.remove(key);
        }
        outcome
    }

    fn forget_dead_flight(&self, key: &QueryKey) {
        let mut in_flight = self.in_flight.lock_recovered("query.forget_dead_flight");
        if let Some(flight) = in_flight.get(key)
            && flight.rx.has_changed().is_err()
        {
            in_flight.remove(key);
        }
    }
}
