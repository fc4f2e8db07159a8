//! Cache configuration.

use std::time::Duration;

/// Default number of live entries a cache may hold.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default time-to-live for entries inserted without an explicit TTL.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 20;

/// Default interval between janitor sweeps.
pub const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 60;

/// Configuration for a [`TtlLruCache`](crate::TtlLruCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries held at once. Must be positive.
    pub capacity: usize,
    /// TTL used by callers that do not pick one themselves.
    pub default_ttl: Duration,
    /// How often the janitor sweeps expired entries. Zero disables it.
    pub janitor_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            janitor_interval: Duration::from_secs(DEFAULT_JANITOR_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `VIGIL_CACHE_CAPACITY`: Maximum entries (default: 10000)
    /// - `VIGIL_CACHE_TTL_SECS`: Default entry TTL (default: 20)
    /// - `VIGIL_CACHE_JANITOR_INTERVAL_SECS`: Sweep interval, 0 disables (default: 60)
    pub fn from_env() -> Self {
        let capacity = std::env::var("VIGIL_CACHE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CACHE_CAPACITY);

        let default_ttl = Duration::from_secs(
            std::env::var("VIGIL_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_TTL_SECS),
        );

        let janitor_interval = Duration::from_secs(
            std::env::var("VIGIL_CACHE_JANITOR_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_JANITOR_INTERVAL_SECS),
        );

        Self {
            capacity,
            default_ttl,
            janitor_interval,
        }
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the default entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the janitor interval.
    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }
}
