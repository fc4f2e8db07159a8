//! In-process bus and key/value store.
//!
//! Used for single-process deployments and by every test in the
//! workspace. Delivery is at-most-once per consumer: a consumer whose
//! buffer is full loses the message, and a consumer that was dropped is
//! pruned on the next publish.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};
use vigil_core::BusError;

use crate::bus::{
    Acknowledger, BusMessage, BusResult, ConsumerConfig, DeliverPolicy, EventBus, KeyValueStore,
    PullConsumer,
};
use crate::subject::{any_matches, is_valid_subject};

/// Default per-consumer buffer.
pub const DEFAULT_CONSUMER_BUFFER: usize = 1024;

/// Default number of published messages retained for `DeliverPolicy::All`.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

// ============================================================================
// CONFIG & STATS
// ============================================================================

/// Sizing for [`InMemoryEventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryBusConfig {
    pub consumer_buffer: usize,
    pub history_limit: usize,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            consumer_buffer: DEFAULT_CONSUMER_BUFFER,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Delivery counters for [`InMemoryEventBus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryBusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub acked: u64,
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    acked: AtomicU64,
}

#[async_trait]
impl Acknowledger for BusCounters {
    async fn ack(&self, _subject: &str) -> BusResult<()> {
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

struct ConsumerSlot {
    filters: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
    generation: u64,
}

/// In-process [`EventBus`].
#[derive(Clone)]
pub struct InMemoryEventBus {
    config: InMemoryBusConfig,
    consumers: Arc<DashMap<String, ConsumerSlot>>,
    /// Retained messages. The lock is also held while fanning out a
    /// publish so consumers observe one global order.
    history: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
    counters: Arc<BusCounters>,
    next_generation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_config(InMemoryBusConfig::default())
    }

    pub fn with_config(config: InMemoryBusConfig) -> Self {
        Self {
            config,
            consumers: Arc::new(DashMap::new()),
            history: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(BusCounters::default()),
            next_generation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> InMemoryBusStats {
        InMemoryBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_consumer(&self, durable: &str) -> bool {
        self.consumers.contains_key(durable)
    }

    /// Close the bus. Every consumer fails on its next fetch and further
    /// publishes are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumers.clear();
        debug!("In-memory event bus closed");
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn message(&self, subject: &str, payload: Vec<u8>) -> BusMessage {
        let acker: Arc<dyn Acknowledger> = self.counters.clone();
        BusMessage::new(subject, payload).with_acker(acker)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.ensure_open()?;
        if !is_valid_subject(subject) {
            return Err(BusError::PublishFailed {
                subject: subject.to_string(),
                reason: "subject must be non-empty literal tokens".to_string(),
            });
        }

        let mut history = self.history.lock();
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if self.config.history_limit > 0 {
            history.push_back((subject.to_string(), payload.clone()));
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        let mut dead = Vec::new();
        for slot in self.consumers.iter() {
            if !any_matches(&slot.filters, subject) {
                continue;
            }
            match slot.tx.try_send(self.message(subject, payload.clone())) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(durable = %slot.key(), subject, "Consumer buffer full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    dead.push((slot.key().clone(), slot.generation));
                }
            }
        }
        drop(history);

        for (durable, generation) in dead {
            if self
                .consumers
                .remove_if(&durable, |_, slot| slot.generation == generation)
                .is_some()
            {
                trace!(durable = %durable, "Pruned dropped consumer");
            }
        }

        Ok(())
    }

    async fn pull_consumer(&self, config: ConsumerConfig) -> BusResult<Box<dyn PullConsumer>> {
        self.ensure_open()?;
        if config.durable.is_empty() {
            return Err(BusError::ConsumerFailed {
                durable: config.durable,
                reason: "durable name must not be empty".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(self.config.consumer_buffer.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // Holding the history lock keeps replay and registration atomic
        // with respect to concurrent publishes.
        let history = self.history.lock();
        if config.deliver_policy == DeliverPolicy::All {
            for (subject, payload) in history.iter() {
                if any_matches(&config.filter_subjects, subject)
                    && tx.try_send(self.message(subject, payload.clone())).is_err()
                {
                    break;
                }
            }
        }

        let replaced = self
            .consumers
            .insert(
                config.durable.clone(),
                ConsumerSlot {
                    filters: config.filter_subjects.clone(),
                    tx,
                    generation,
                },
            )
            .is_some();
        drop(history);

        debug!(
            durable = %config.durable,
            filters = ?config.filter_subjects,
            replaced,
            "Created pull consumer"
        );

        Ok(Box::new(InMemoryPullConsumer {
            durable: config.durable,
            rx,
        }))
    }

    async fn delete_consumer(&self, durable: &str) -> BusResult<bool> {
        Ok(self.consumers.remove(durable).is_some())
    }
}

/// Pull consumer handed out by [`InMemoryEventBus`].
pub struct InMemoryPullConsumer {
    durable: String,
    rx: mpsc::Receiver<BusMessage>,
}

#[async_trait]
impl PullConsumer for InMemoryPullConsumer {
    async fn fetch(&mut self, max: usize, max_wait: Duration) -> BusResult<Vec<BusMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let first = match tokio::time::timeout(max_wait, self.rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => {
                return Err(BusError::ConsumerFailed {
                    durable: self.durable.clone(),
                    reason: "consumer was deleted or replaced".to_string(),
                })
            }
            Ok(Some(msg)) => msg,
        };

        let mut batch = Vec::with_capacity(max.min(64));
        batch.push(first);
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn durable(&self) -> &str {
        &self.durable
    }
}

// ============================================================================
// KEY/VALUE STORE
// ============================================================================

struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        !matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// In-process [`KeyValueStore`]. A zero TTL keeps the key until deleted.
#[derive(Clone, Default)]
pub struct InMemoryKeyValue {
    entries: Arc<DashMap<String, KvEntry>>,
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValue {
    async fn create(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BusResult<bool> {
        let now = Instant::now();
        let fresh = KvEntry {
            value,
            expires_at: if ttl.is_zero() {
                None
            } else {
                now.checked_add(ttl)
            },
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> BusResult<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> BusResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn purge_expired(&self) -> BusResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_publish_reaches_matching_consumer() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("c1").with_filter("userinfo.changed.*"))
            .await?;

        bus.publish("userinfo.changed.1", b"a".to_vec()).await?;
        bus.publish("userinfo.poll", b"b".to_vec()).await?;

        let batch = consumer.fetch(10, WAIT).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "userinfo.changed.1");
        assert_eq!(batch[0].payload, b"a".to_vec());

        batch[0].ack().await?;
        assert_eq!(bus.stats().acked, 1);
        assert_eq!(bus.stats().published, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_empty_batch() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("c1").with_filter("a.b"))
            .await?;
        let batch = consumer.fetch(4, Duration::from_millis(10)).await?;
        assert!(batch.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_respects_batch_size() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("c1").with_filter("a.>"))
            .await?;
        for i in 0..5 {
            bus.publish(&format!("a.{}", i), Vec::new()).await?;
        }

        assert_eq!(consumer.fetch(3, WAIT).await?.len(), 3);
        let rest = consumer.fetch(3, WAIT).await?;
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].subject, "a.4");
        Ok(())
    }

    #[tokio::test]
    async fn test_replacing_durable_fails_old_consumer() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let mut old = bus
            .pull_consumer(ConsumerConfig::new("same").with_filter("a.b"))
            .await?;
        let mut new = bus
            .pull_consumer(ConsumerConfig::new("same").with_filter("a.b"))
            .await?;
        assert_eq!(bus.consumer_count(), 1);

        assert!(old.fetch(1, WAIT).await.is_err());

        bus.publish("a.b", Vec::new()).await?;
        assert_eq!(new.fetch(1, WAIT).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_consumer_fails_fetch() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("gone").with_filter("a.b"))
            .await?;
        assert!(bus.delete_consumer("gone").await?);
        assert!(!bus.delete_consumer("gone").await?);
        assert!(matches!(
            consumer.fetch(1, WAIT).await,
            Err(BusError::ConsumerFailed { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_pruned() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        let consumer = bus
            .pull_consumer(ConsumerConfig::new("short").with_filter("a.b"))
            .await?;
        drop(consumer);

        bus.publish("a.b", Vec::new()).await?;
        assert!(!bus.has_consumer("short"));
        Ok(())
    }

    #[tokio::test]
    async fn test_deliver_all_replays_history() -> BusResult<()> {
        let bus = InMemoryEventBus::new();
        bus.publish("a.1", Vec::new()).await?;
        bus.publish("b.1", Vec::new()).await?;

        let mut replay = bus
            .pull_consumer(
                ConsumerConfig::new("replay")
                    .with_filter("a.*")
                    .with_deliver_policy(DeliverPolicy::All),
            )
            .await?;
        let mut live = bus
            .pull_consumer(ConsumerConfig::new("live").with_filter("a.*"))
            .await?;

        assert_eq!(replay.fetch(10, WAIT).await?.len(), 1);
        assert!(live.fetch(10, Duration::from_millis(10)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_full_buffer_drops() -> BusResult<()> {
        let bus = InMemoryEventBus::with_config(InMemoryBusConfig {
            consumer_buffer: 1,
            history_limit: 0,
        });
        let _consumer = bus
            .pull_consumer(ConsumerConfig::new("tiny").with_filter("a.b"))
            .await?;
        bus.publish("a.b", Vec::new()).await?;
        bus.publish("a.b", Vec::new()).await?;
        assert_eq!(bus.stats().delivered, 1);
        assert_eq!(bus.stats().dropped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_bus_rejects() {
        let bus = InMemoryEventBus::new();
        bus.close();
        assert!(matches!(
            bus.publish("a.b", Vec::new()).await,
            Err(BusError::Closed)
        ));
        assert!(bus.pull_consumer(ConsumerConfig::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let bus = InMemoryEventBus::new();
        assert!(matches!(
            bus.publish("a.*", Vec::new()).await,
            Err(BusError::PublishFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_kv_create_is_exclusive_until_expiry() -> BusResult<()> {
        let kv = InMemoryKeyValue::new();
        assert!(kv.create("1:2", Vec::new(), Duration::from_millis(20)).await?);
        assert!(!kv.create("1:2", Vec::new(), Duration::from_millis(20)).await?);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("1:2").await?, None);
        assert!(kv.create("1:2", b"v".to_vec(), Duration::ZERO).await?);
        assert_eq!(kv.get("1:2").await?, Some(b"v".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_kv_purge_and_delete() -> BusResult<()> {
        let kv = InMemoryKeyValue::new();
        kv.create("short", Vec::new(), Duration::from_millis(5)).await?;
        kv.create("long", Vec::new(), Duration::from_secs(60)).await?;
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert_eq!(kv.purge_expired().await?, 1);
        assert_eq!(kv.len(), 1);
        assert!(kv.delete("long").await?);
        assert!(kv.is_empty());
        Ok(())
    }
}
