//! Cache configuration.
//!
//! One [`CacheConfig`] per [`CacheClient`](crate::client::CacheClient)
//! instance; embed it in an application config file via serde.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_STALE_TIME_MS: u64 = 30_000;
const DEFAULT_DETACHED_ENTRY_LIMIT: usize = 256;
const DEFAULT_MIN_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a fresh value may be served without refetch, unless a query
    /// overrides it.
    pub default_stale_time_ms: u64,
    /// How many unsubscribed entries to retain for grace-period revival.
    /// Protects against refetch storms on rapid remount.
    pub detached_entry_limit: usize,
    /// Floor for polling intervals; tighter requests are clamped up.
    pub min_poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time_ms: DEFAULT_STALE_TIME_MS,
            detached_entry_limit: DEFAULT_DETACHED_ENTRY_LIMIT,
            min_poll_interval_ms: DEFAULT_MIN_POLL_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn default_stale_time(&self) -> Duration {
        Duration::from_millis(self.default_stale_time_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    /// Returns the detached entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn detached_entry_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.detached_entry_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.default_stale_time_ms, 30_000);
        assert_eq!(config.detached_entry_limit, 256);
        assert_eq!(config.min_poll_interval_ms, 250);
    }

    #[test]
    fn durations_derive_from_millis() {
        let config = CacheConfig {
            default_stale_time_ms: 1_500,
            min_poll_interval_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.default_stale_time(), Duration::from_millis(1_500));
        assert_eq!(config.min_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            detached_entry_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.detached_entry_limit_non_zero().get(), 1);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"default_stale_time_ms": 5000}"#).expect("valid config");
        assert_eq!(config.default_stale_time_ms, 5_000);
        assert_eq!(config.detached_entry_limit, 256);
    }
}
