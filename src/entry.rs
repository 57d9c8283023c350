//! Cache entry state.
//!
//! [`CacheEntry`] is the externally visible snapshot of one key's state;
//! [`EntrySnapshot`] is the deep copy a mutation captures for rollback.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::key::QueryKey;

/// Freshness state of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Known key, nothing resolved yet.
    Idle,
    /// A fetch is in flight; at most one per key at any time.
    Fetching,
    /// Resolved within the freshness window.
    Fresh,
    /// Freshness window expired or explicitly invalidated; the value is
    /// still servable as a fallback but due for re-fetch.
    Stale,
    /// Last resolution failed; the last good value is retained.
    Error,
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    /// Last known resolved data, if any. Shared, never mutated in place.
    pub value: Option<Arc<Value>>,
    pub status: EntryStatus,
    pub last_resolved_at: Option<Instant>,
    /// Last failure, retained alongside the last good value.
    pub error: Option<Arc<FetchError>>,
    pub subscriber_count: usize,
}

impl CacheEntry {
    /// Whether this entry can be served without a fetch under the given
    /// freshness window.
    pub fn is_fresh_within(&self, stale_time: Duration) -> bool {
        self.status == EntryStatus::Fresh
            && self
                .last_resolved_at
                .is_some_and(|at| at.elapsed() < stale_time)
    }
}

/// Deep copy of an entry's state, captured before an optimistic write so a
/// failed mutation can restore it.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub value: Option<Value>,
    pub status: EntryStatus,
    pub last_resolved_at: Option<Instant>,
    pub error: Option<Arc<FetchError>>,
}

impl EntrySnapshot {
    /// Snapshot of a key the store has never seen.
    pub fn absent() -> Self {
        Self {
            value: None,
            status: EntryStatus::Idle,
            last_resolved_at: None,
            error: None,
        }
    }
}
