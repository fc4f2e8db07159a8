//! Constants for VIGIL API
//!
//! This module contains all constant values used throughout the API.
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// Default session token expiration time in seconds (1 hour)
pub const DEFAULT_JWT_EXPIRATION_SECS: i64 = 3600;

/// Default clock skew tolerance for token validation in seconds
pub const DEFAULT_JWT_CLOCK_SKEW_SECS: i64 = 60;

/// Minimum required length for JWT secret keys
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Placeholder secret used when none is configured
pub const INSECURE_DEFAULT_JWT_SECRET: &str = "INSECURE_DEFAULT_SECRET_CHANGE_IN_PRODUCTION";

// ============================================================================
// POLLER
// ============================================================================

/// Default interval between batch lookups in seconds
pub const DEFAULT_BATCH_INTERVAL_SECS: u64 = 20;

/// Default lifetime of a poll dedup marker in seconds. Never below the batch interval.
pub const DEFAULT_DEDUP_TTL_SECS: u64 = 20;

/// Default number of poll messages fetched per round
pub const DEFAULT_POLL_FETCH_BATCH: usize = 64;

/// Default bounded wait for a poll fetch in milliseconds
pub const DEFAULT_POLL_FETCH_WAIT_MS: u64 = 2000;

/// Default interval between sweeps of expired dedup markers in seconds
pub const DEFAULT_MARKER_SWEEP_INTERVAL_SECS: u64 = 60;

/// Durable consumer name of the poll intake
pub const POLLER_DURABLE: &str = "userinfo-poller";

// ============================================================================
// USER INFO
// ============================================================================

/// Default TTL for cached user info in seconds
pub const DEFAULT_USERINFO_CACHE_TTL_SECS: u64 = 20;

/// Durable consumer name of the change subscriber
pub const CHANGE_SUBSCRIBER_DURABLE: &str = "userinfo-changes";

/// Default number of change events fetched per round
pub const DEFAULT_CHANGE_FETCH_BATCH: usize = 32;

// ============================================================================
// STREAMS
// ============================================================================

/// Default session re-validation interval in seconds
pub const DEFAULT_REVALIDATE_INTERVAL_SECS: u64 = 15;

/// Default number of re-validation ticks between unread counter resyncs
pub const DEFAULT_RESYNC_EVERY_TICKS: u32 = 4;

/// Default number of events fetched per fan-in round
pub const DEFAULT_STREAM_FETCH_BATCH: usize = 8;

/// Default bounded wait for a fan-in fetch in milliseconds
pub const DEFAULT_STREAM_FETCH_WAIT_MS: u64 = 2000;

/// Default outbound envelope buffer per stream
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Remaining token lifetime below which clients are told to refresh, in seconds
pub const DEFAULT_TOKEN_REFRESH_WINDOW_SECS: i64 = 600;

/// Prefix of per-session durable consumer names
pub const STREAM_DURABLE_PREFIX: &str = "stream";

// ============================================================================
// DATABASE
// ============================================================================

/// Default maximum connection pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default connection acquisition timeout in seconds
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// TELEMETRY
// ============================================================================

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "vigil_api=debug,info";

/// Default service name reported in logs
pub const DEFAULT_SERVICE_NAME: &str = "vigil-api";
