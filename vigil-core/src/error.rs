//! Error types for VIGIL operations

use std::time::Duration;
use thiserror::Error;

/// Relational store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Query failed on {table}: {reason}")]
    QueryFailed { table: String, reason: String },

    #[error("Invalid row in {table}: column {column}: {reason}")]
    InvalidRow {
        table: String,
        column: String,
        reason: String,
    },

    #[error("Write failed on {table}: {reason}")]
    WriteFailed { table: String, reason: String },

    #[error("Connection unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Event bus and key/value store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Publish to {subject} failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    #[error("Consumer {durable} failed: {reason}")]
    ConsumerFailed { durable: String, reason: String },

    #[error("Acknowledgement failed: {reason}")]
    AckFailed { reason: String },

    #[error("Key/value operation on {key} failed: {reason}")]
    KeyValueFailed { key: String, reason: String },

    #[error("Bus connection closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Dedup marker TTL {marker_ttl:?} is shorter than batch interval {batch_interval:?}")]
    DedupWindowTooShort {
        marker_ttl: Duration,
        batch_interval: Duration,
    },
}

/// Cache construction errors. Runtime cache operations never fail.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache capacity must be positive, got {capacity}")]
    InvalidCapacity { capacity: usize },
}

/// Master error type for all VIGIL errors.
#[derive(Debug, Clone, Error)]
pub enum VigilError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Result type alias for VIGIL operations.
pub type VigilResult<T> = Result<T, VigilError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_invalid_row() {
        let err = StoreError::InvalidRow {
            table: "accounts".to_string(),
            column: "id".to_string(),
            reason: "negative".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("accounts"));
        assert!(msg.contains("id"));
        assert!(msg.contains("negative"));
    }

    #[test]
    fn test_config_error_display_dedup_window() {
        let err = ConfigError::DedupWindowTooShort {
            marker_ttl: Duration::from_secs(5),
            batch_interval: Duration::from_secs(20),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("5s"));
        assert!(msg.contains("20s"));
    }

    #[test]
    fn test_vigil_error_from_conversions() {
        let err: VigilError = CacheError::InvalidCapacity { capacity: 0 }.into();
        assert!(matches!(err, VigilError::Cache(_)));
        assert!(format!("{}", err).contains("capacity"));

        let err: VigilError = BusError::Closed.into();
        assert!(matches!(err, VigilError::Bus(BusError::Closed)));
    }
}
