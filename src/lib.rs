//! Refresco Cache Core
//!
//! Client-side data freshness for keyed resources:
//!
//! - **Keyed Cache Store**: single source of truth for last-known values,
//!   freshness state and subscribers
//! - **Query Engine**: stale-while-revalidate resolution with request
//!   coalescing (at most one in-flight fetch per key)
//! - **Mutation Engine**: optimistic writes with snapshot rollback and
//!   reconciliation by refetch
//! - **Invalidation Bus**: prefix-scoped staleness broadcast that pushes
//!   re-resolution to watched keys
//! - **Polling Scheduler**: periodic stale-mark-and-refetch timers
//!
//! ## Configuration
//!
//! Embed a [`CacheConfig`] in the application config file:
//!
//! ```toml
//! [cache]
//! default_stale_time_ms = 30000
//! detached_entry_limit = 256
//! min_poll_interval_ms = 250
//! ```

mod bus;
mod client;
mod config;
mod entry;
mod error;
mod fetcher;
pub mod key;
mod lock;
mod mutation;
mod polling;
pub mod projection;
mod query;
mod store;

pub use bus::{InvalidationBus, InvalidationEvent};
pub use client::CacheClient;
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntrySnapshot, EntryStatus};
pub use error::{FetchError, MutationError, QueryError};
pub use fetcher::{Fetcher, FnFetcher, FnMutator, Mutator};
pub use key::{KeyScope, QueryKey, namespace};
pub use mutation::{MutationConfig, MutationEngine, MutationReceipt, ProjectFn};
pub use polling::{PollingHandle, PollingScheduler};
pub use query::{QueryEngine, QueryOptions};
pub use store::{CacheStore, Subscription, WatchCallback};
