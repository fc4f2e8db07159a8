//! Service Configuration Module
//!
//! Configuration for the poller, the user info retriever and the stream
//! multiplexer, plus [`AppConfig`] which gathers every section the binary
//! needs. All sections load from `VIGIL_*` environment variables with
//! development-friendly defaults.

use crate::auth::AuthConfig;
use crate::constants::*;
use crate::db::DbConfig;
use crate::telemetry::TelemetryConfig;
use std::str::FromStr;
use std::time::Duration;
use vigil_cache::CacheConfig;
use vigil_core::ConfigError;

// ============================================================================
// ENV HELPERS
// ============================================================================

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|s| {
            s.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// POLLER CONFIGURATION
// ============================================================================

/// Configuration for poll intake and the batch processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Interval between batch lookups.
    pub batch_interval: Duration,

    /// Lifetime of the dedup marker written per poll request.
    pub dedup_ttl: Duration,

    /// Maximum poll messages fetched per round.
    pub fetch_batch: usize,

    /// Bounded wait for a poll fetch.
    pub fetch_wait: Duration,

    /// Durable consumer name of the intake.
    pub durable: String,

    /// How often expired dedup markers are swept. Zero disables the sweep.
    pub marker_sweep_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_secs(DEFAULT_BATCH_INTERVAL_SECS),
            dedup_ttl: Duration::from_secs(DEFAULT_DEDUP_TTL_SECS),
            fetch_batch: DEFAULT_POLL_FETCH_BATCH,
            fetch_wait: Duration::from_millis(DEFAULT_POLL_FETCH_WAIT_MS),
            durable: POLLER_DURABLE.to_string(),
            marker_sweep_interval: Duration::from_secs(DEFAULT_MARKER_SWEEP_INTERVAL_SECS),
        }
    }
}

impl PollerConfig {
    /// Environment variables:
    /// - `VIGIL_POLL_BATCH_INTERVAL_SECS` (default: 20)
    /// - `VIGIL_POLL_DEDUP_TTL_SECS` (default: 20)
    /// - `VIGIL_POLL_FETCH_BATCH` (default: 64)
    /// - `VIGIL_POLL_FETCH_WAIT_MS` (default: 2000)
    /// - `VIGIL_POLL_MARKER_SWEEP_SECS` (default: 60, 0 disables)
    pub fn from_env() -> Self {
        Self {
            batch_interval: env_secs("VIGIL_POLL_BATCH_INTERVAL_SECS", DEFAULT_BATCH_INTERVAL_SECS),
            dedup_ttl: env_secs("VIGIL_POLL_DEDUP_TTL_SECS", DEFAULT_DEDUP_TTL_SECS),
            fetch_batch: env_parse("VIGIL_POLL_FETCH_BATCH", DEFAULT_POLL_FETCH_BATCH),
            fetch_wait: env_millis("VIGIL_POLL_FETCH_WAIT_MS", DEFAULT_POLL_FETCH_WAIT_MS),
            durable: POLLER_DURABLE.to_string(),
            marker_sweep_interval: env_secs(
                "VIGIL_POLL_MARKER_SWEEP_SECS",
                DEFAULT_MARKER_SWEEP_INTERVAL_SECS,
            ),
        }
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_marker_sweep_interval(mut self, interval: Duration) -> Self {
        self.marker_sweep_interval = interval;
        self
    }

    /// A dedup marker that expires before the batch runs would let a
    /// duplicate through inside one window, so that combination is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_interval.is_zero() {
            return Err(invalid("batch_interval", "0s", "must be positive"));
        }
        if self.fetch_batch == 0 {
            return Err(invalid("fetch_batch", 0, "must be positive"));
        }
        if self.durable.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "durable".to_string(),
            });
        }
        if self.dedup_ttl < self.batch_interval {
            return Err(ConfigError::DedupWindowTooShort {
                marker_ttl: self.dedup_ttl,
                batch_interval: self.batch_interval,
            });
        }
        Ok(())
    }
}

// ============================================================================
// USER INFO CONFIGURATION
// ============================================================================

/// Configuration for the user info retriever and its change subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfoConfig {
    /// Groups whose members may act as superuser.
    pub superuser_groups: Vec<String>,

    /// Licenses that may act as superuser regardless of group.
    pub superuser_users: Vec<String>,

    /// TTL of cached user info entries.
    pub cache_ttl: Duration,

    /// Durable consumer name of the change subscriber.
    pub durable: String,

    pub fetch_batch: usize,
    pub fetch_wait: Duration,
}

impl Default for UserInfoConfig {
    fn default() -> Self {
        Self {
            superuser_groups: Vec::new(),
            superuser_users: Vec::new(),
            cache_ttl: Duration::from_secs(DEFAULT_USERINFO_CACHE_TTL_SECS),
            durable: CHANGE_SUBSCRIBER_DURABLE.to_string(),
            fetch_batch: DEFAULT_CHANGE_FETCH_BATCH,
            fetch_wait: Duration::from_millis(DEFAULT_POLL_FETCH_WAIT_MS),
        }
    }
}

impl UserInfoConfig {
    /// Environment variables:
    /// - `VIGIL_SUPERUSER_GROUPS`: Comma-separated group names
    /// - `VIGIL_SUPERUSER_USERS`: Comma-separated licenses
    /// - `VIGIL_USERINFO_CACHE_TTL_SECS` (default: 20)
    pub fn from_env() -> Self {
        Self {
            superuser_groups: env_list("VIGIL_SUPERUSER_GROUPS"),
            superuser_users: env_list("VIGIL_SUPERUSER_USERS"),
            cache_ttl: env_secs(
                "VIGIL_USERINFO_CACHE_TTL_SECS",
                DEFAULT_USERINFO_CACHE_TTL_SECS,
            ),
            ..Self::default()
        }
    }

    pub fn with_superuser_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.superuser_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_superuser_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.superuser_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_batch == 0 {
            return Err(invalid("fetch_batch", 0, "must be positive"));
        }
        if self.durable.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "durable".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// STREAM CONFIGURATION
// ============================================================================

/// Configuration for notification stream sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Interval between session re-validations.
    pub revalidate_interval: Duration,

    /// Re-validation ticks between unread counter resyncs.
    pub resync_every_ticks: u32,

    pub fetch_batch: usize,
    pub fetch_wait: Duration,

    /// Capacity of the per-session outbound channel.
    pub outbound_buffer: usize,

    /// Remaining token lifetime that triggers a refresh directive.
    pub token_refresh_window_secs: i64,

    /// End sessions whose account switched to another character.
    pub character_lock: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            revalidate_interval: Duration::from_secs(DEFAULT_REVALIDATE_INTERVAL_SECS),
            resync_every_ticks: DEFAULT_RESYNC_EVERY_TICKS,
            fetch_batch: DEFAULT_STREAM_FETCH_BATCH,
            fetch_wait: Duration::from_millis(DEFAULT_STREAM_FETCH_WAIT_MS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            token_refresh_window_secs: DEFAULT_TOKEN_REFRESH_WINDOW_SECS,
            character_lock: true,
        }
    }
}

impl StreamConfig {
    /// Environment variables:
    /// - `VIGIL_STREAM_REVALIDATE_SECS` (default: 15)
    /// - `VIGIL_STREAM_RESYNC_TICKS` (default: 4)
    /// - `VIGIL_STREAM_FETCH_BATCH` (default: 8)
    /// - `VIGIL_STREAM_FETCH_WAIT_MS` (default: 2000)
    /// - `VIGIL_STREAM_OUTBOUND_BUFFER` (default: 64)
    /// - `VIGIL_STREAM_TOKEN_REFRESH_WINDOW_SECS` (default: 600)
    /// - `VIGIL_STREAM_CHARACTER_LOCK` (default: true)
    pub fn from_env() -> Self {
        Self {
            revalidate_interval: env_secs(
                "VIGIL_STREAM_REVALIDATE_SECS",
                DEFAULT_REVALIDATE_INTERVAL_SECS,
            ),
            resync_every_ticks: env_parse("VIGIL_STREAM_RESYNC_TICKS", DEFAULT_RESYNC_EVERY_TICKS),
            fetch_batch: env_parse("VIGIL_STREAM_FETCH_BATCH", DEFAULT_STREAM_FETCH_BATCH),
            fetch_wait: env_millis("VIGIL_STREAM_FETCH_WAIT_MS", DEFAULT_STREAM_FETCH_WAIT_MS),
            outbound_buffer: env_parse("VIGIL_STREAM_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER),
            token_refresh_window_secs: env_parse(
                "VIGIL_STREAM_TOKEN_REFRESH_WINDOW_SECS",
                DEFAULT_TOKEN_REFRESH_WINDOW_SECS,
            ),
            character_lock: env_bool("VIGIL_STREAM_CHARACTER_LOCK", true),
        }
    }

    pub fn with_revalidate_interval(mut self, interval: Duration) -> Self {
        self.revalidate_interval = interval;
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_resync_every_ticks(mut self, ticks: u32) -> Self {
        self.resync_every_ticks = ticks;
        self
    }

    pub fn with_character_lock(mut self, enabled: bool) -> Self {
        self.character_lock = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.revalidate_interval.is_zero() {
            return Err(invalid("revalidate_interval", "0s", "must be positive"));
        }
        if self.resync_every_ticks == 0 {
            return Err(invalid("resync_every_ticks", 0, "must be positive"));
        }
        if self.fetch_batch == 0 {
            return Err(invalid("fetch_batch", 0, "must be positive"));
        }
        if self.outbound_buffer == 0 {
            return Err(invalid("outbound_buffer", 0, "must be positive"));
        }
        if self.token_refresh_window_secs < 0 {
            return Err(invalid(
                "token_refresh_window_secs",
                self.token_refresh_window_secs,
                "must not be negative",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// APPLICATION CONFIGURATION
// ============================================================================

/// Every configuration section used by the `vigil-api` binary.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub db: DbConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub poller: PollerConfig,
    pub userinfo: UserInfoConfig,
    pub stream: StreamConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db: DbConfig::from_env(),
            auth: AuthConfig::from_env(),
            cache: CacheConfig::from_env(),
            poller: PollerConfig::from_env(),
            userinfo: UserInfoConfig::from_env(),
            stream: StreamConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }

    /// Validate every section. Cache capacity is checked here as well so
    /// that a bad value fails at startup rather than at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", 0, "must be positive"));
        }
        self.poller.validate()?;
        self.userinfo.validate()?;
        self.stream.validate()?;
        Ok(())
    }
}
