//! Event bus and key/value store contracts.
//!
//! The bus is subject-addressed publish/subscribe with durable pull
//! consumers. Consumers fetch messages in batches and acknowledge each one
//! explicitly. The key/value store only needs atomic create-if-absent with
//! a TTL, which is what the poller uses for duplicate suppression.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use vigil_core::BusError;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

// ============================================================================
// MESSAGES
// ============================================================================

/// Acknowledges a delivered message back to the bus.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, subject: &str) -> BusResult<()>;
}

/// A message delivered to a pull consumer.
#[derive(Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl BusMessage {
    /// Message with no acknowledgement target, used for replay and tests.
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledge the message. A message without an acknowledger is a no-op.
    pub async fn ack(&self) -> BusResult<()> {
        match &self.acker {
            Some(acker) => acker.ack(&self.subject).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// CONSUMERS
// ============================================================================

/// Where a newly created consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Replay whatever the bus still retains, then follow live messages.
    All,
    /// Only messages published after the consumer was created.
    #[default]
    New,
}

/// Configuration for a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer name. Creating a consumer with an existing name replaces it.
    pub durable: String,
    /// Subject filters, wildcards allowed. Empty matches nothing.
    pub filter_subjects: Vec<String>,
    pub deliver_policy: DeliverPolicy,
}

impl ConsumerConfig {
    pub fn new(durable: impl Into<String>) -> Self {
        Self {
            durable: durable.into(),
            filter_subjects: Vec::new(),
            deliver_policy: DeliverPolicy::default(),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_subjects.push(filter.into());
        self
    }

    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_subjects.extend(filters.into_iter().map(Into::into));
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }
}

/// A pull consumer bound to one durable name.
#[async_trait]
pub trait PullConsumer: Send {
    /// Fetch up to `max` messages, waiting at most `max_wait` for the first.
    ///
    /// A timeout is not an error: it yields an empty batch. An error means
    /// the consumer is unusable and must be re-created.
    async fn fetch(&mut self, max: usize, max_wait: Duration) -> BusResult<Vec<BusMessage>>;

    fn durable(&self) -> &str;
}

// ============================================================================
// BUS
// ============================================================================

/// Subject-addressed publish/subscribe bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Create or replace a durable pull consumer.
    async fn pull_consumer(&self, config: ConsumerConfig) -> BusResult<Box<dyn PullConsumer>>;

    /// Remove a durable consumer. Returns whether one existed.
    async fn delete_consumer(&self, durable: &str) -> BusResult<bool>;
}

/// Key/value store with per-key TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically create `key` if it does not exist.
    ///
    /// Returns `Ok(false)` when a live key already exists.
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BusResult<bool>;

    async fn get(&self, key: &str) -> BusResult<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> BusResult<bool>;

    /// Drop expired keys and return how many were removed. Stores that
    /// expire keys on their own keep the default.
    async fn purge_expired(&self) -> BusResult<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAcker(AtomicUsize);

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self, _subject: &str) -> BusResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_message_ack_reaches_acker() {
        let acker = Arc::new(CountingAcker(AtomicUsize::new(0)));
        let msg = BusMessage::new("a.b", vec![1, 2]).with_acker(acker.clone());
        assert!(msg.ack().await.is_ok());
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);

        let bare = BusMessage::new("a.b", Vec::new());
        assert!(bare.ack().await.is_ok());
    }

    #[test]
    fn test_consumer_config_builder() {
        let config = ConsumerConfig::new("stream-1")
            .with_filter("notifications.system")
            .with_filters(["userinfo.user.1", "notifications.user.1"])
            .with_deliver_policy(DeliverPolicy::All);
        assert_eq!(config.durable, "stream-1");
        assert_eq!(config.filter_subjects.len(), 3);
        assert_eq!(config.deliver_policy, DeliverPolicy::All);
        assert_eq!(ConsumerConfig::new("x").deliver_policy, DeliverPolicy::New);
    }

    #[test]
    fn test_message_debug_hides_payload() {
        let msg = BusMessage::new("a.b", vec![0; 16]);
        let debug = format!("{:?}", msg);
        assert!(debug.contains("payload_len: 16"));
    }
}
