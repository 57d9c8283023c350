//! Polling scheduler.
//!
//! Forces periodic re-resolution of a key regardless of consumer activity:
//! each tick marks the key stale and re-resolves it with its registered
//! fetcher. Timers are independent per [`start_polling`] call, so several
//! consumers polling the same key at different intervals simply union their
//! staleness; coalescing in the query engine keeps overlapping ticks down
//! to one fetch.
//!
//! [`start_polling`]: PollingScheduler::start_polling

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, trace};

use crate::key::{KeyScope, QueryKey};
use crate::query::QueryEngine;
use crate::store::CacheStore;

const METRIC_POLL_TICK_TOTAL: &str = "refresco_polling_tick_total";

pub struct PollingScheduler {
    store: Arc<CacheStore>,
    query: Arc<QueryEngine>,
    min_interval: Duration,
}

impl PollingScheduler {
    pub fn new(store: Arc<CacheStore>, query: Arc<QueryEngine>, min_interval: Duration) -> Self {
        Self {
            store,
            query,
            min_interval,
        }
    }

    /// Start a repeating timer for one key. Intervals below the configured
    /// floor are clamped up to it.
    ///
    /// The returned handle owns the timer; stopping it (or dropping it)
    /// halts future ticks without cancelling a tick already resolving.
    pub fn start_polling(&self, key: QueryKey, interval: Duration) -> PollingHandle {
        let every = interval.max(self.min_interval);
        if every > interval {
            debug!(key = %key, requested_ms = interval.as_millis() as u64, "polling interval clamped");
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let query = Arc::clone(&self.query);
        let first_tick = tokio::time::Instant::now() + every;

        let task = tokio::spawn(async move {
            let mut ticks = interval_at(first_tick, every);
            // A missed deadline reschedules from now rather than bursting.
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        counter!(METRIC_POLL_TICK_TOTAL).increment(1);
                        trace!(key = %key, "polling tick");
                        store.mark_stale(&KeyScope::Exact(key.clone()));
                        if let Some(Err(error)) = query.refresh(&key, false).await {
                            debug!(key = %key, %error, "polled refresh failed");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        PollingHandle { stop_tx, task }
    }
}

/// Owned lifecycle of one polling timer.
pub struct PollingHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollingHandle {
    /// Stop future ticks. Idempotent; an in-flight tick still settles.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Whether the timer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
