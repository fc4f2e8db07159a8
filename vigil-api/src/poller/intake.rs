//! Poll intake with distributed duplicate suppression.
//!
//! Each inbound poll request writes a short-lived marker keyed
//! `accountId:userId` to the key/value store. Only the request that creates
//! the marker is queued, so a burst of identical polls inside one window
//! costs one lookup. Dedup is advisory: if the store is unreachable the
//! request is queued anyway.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use vigil_core::subject::POLL_SUBJECT;
use vigil_core::{PollRequest, UserAccountKey};
use vigil_events::{BusMessage, ConsumerConfig, EventBus, KeyValueStore, PullConsumer};

use crate::config::PollerConfig;
use crate::telemetry::metrics::with_metrics;

// ============================================================================
// PENDING SET
// ============================================================================

/// Poll requests waiting for the next batch, at most one per key.
#[derive(Debug, Clone, Default)]
pub struct PendingPolls {
    inner: Arc<Mutex<HashMap<UserAccountKey, PollRequest>>>,
}

impl PendingPolls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request. Returns false if the key was already pending.
    pub fn insert(&self, request: PollRequest) -> bool {
        self.inner.lock().insert(request.key(), request).is_none()
    }

    /// Swap the pending map for an empty one and return its contents.
    pub fn take_all(&self) -> HashMap<UserAccountKey, PollRequest> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

// ============================================================================
// MESSAGE HANDLING
// ============================================================================

/// What happened to one inbound poll message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Marker created, request queued.
    Queued,
    /// A live marker already existed.
    Duplicate,
    /// Payload could not be decoded and was dropped.
    Malformed,
    /// The marker store failed; the request was queued anyway.
    DedupUnavailable,
}

impl IntakeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeOutcome::Queued => "queued",
            IntakeOutcome::Duplicate => "duplicate",
            IntakeOutcome::Malformed => "malformed",
            IntakeOutcome::DedupUnavailable => "dedup_unavailable",
        }
    }
}

/// Classify and queue one poll message. The message is always acknowledged.
pub async fn handle_poll_message(
    message: &BusMessage,
    kv: &dyn KeyValueStore,
    pending: &PendingPolls,
    dedup_ttl: Duration,
) -> IntakeOutcome {
    let outcome = match serde_json::from_slice::<PollRequest>(&message.payload) {
        Err(e) => {
            warn!(subject = %message.subject, error = %e, "Dropping malformed poll request");
            IntakeOutcome::Malformed
        }
        Ok(request) => {
            let key = request.dedup_key();
            match kv.create(&key, Vec::new(), dedup_ttl).await {
                Ok(true) => {
                    pending.insert(request);
                    IntakeOutcome::Queued
                }
                Ok(false) => {
                    trace!(key = %key, "Duplicate poll request suppressed");
                    IntakeOutcome::Duplicate
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dedup marker unavailable, queueing poll anyway");
                    pending.insert(request);
                    IntakeOutcome::DedupUnavailable
                }
            }
        }
    };

    if let Err(e) = message.ack().await {
        warn!(subject = %message.subject, error = %e, "Failed to ack poll request");
    }
    with_metrics(|m| m.record_poll(outcome.as_str()));
    outcome
}

// ============================================================================
// INTAKE LOOP
// ============================================================================

async fn open_consumer(
    bus: &dyn EventBus,
    config: &PollerConfig,
) -> Result<Box<dyn PullConsumer>, vigil_core::BusError> {
    bus.pull_consumer(ConsumerConfig::new(config.durable.clone()).with_filter(POLL_SUBJECT))
        .await
}

/// Consume `userinfo.poll` until `shutdown` is cancelled.
///
/// A failed fetch re-creates the consumer right away. If re-creation fails
/// too, the loop waits one fetch window before trying again.
pub async fn run_intake(
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KeyValueStore>,
    pending: PendingPolls,
    config: PollerConfig,
    shutdown: CancellationToken,
) {
    info!(durable = %config.durable, "Poll intake started");
    let mut consumer: Option<Box<dyn PullConsumer>> = None;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if consumer.is_none() {
            match open_consumer(bus.as_ref(), &config).await {
                Ok(created) => consumer = Some(created),
                Err(e) => {
                    error!(durable = %config.durable, error = %e, "Failed to create poll consumer");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.fetch_wait) => continue,
                    }
                }
            }
        }
        let Some(active) = consumer.as_mut() else {
            continue;
        };

        let fetched = tokio::select! {
            _ = shutdown.cancelled() => break,
            fetched = active.fetch(config.fetch_batch, config.fetch_wait) => fetched,
        };

        match fetched {
            Ok(messages) => {
                for message in &messages {
                    handle_poll_message(message, kv.as_ref(), &pending, config.dedup_ttl).await;
                }
                if !messages.is_empty() {
                    debug!(received = messages.len(), pending = pending.len(), "Poll intake round");
                }
            }
            Err(e) => {
                warn!(durable = %config.durable, error = %e, "Poll fetch failed, re-creating consumer");
                consumer = None;
            }
        }
    }

    info!(durable = %config.durable, "Poll intake stopped");
}

/// Sweep expired dedup markers every `interval` until `shutdown` is cancelled.
///
/// Only matters for stores without native expiry, which otherwise keep one
/// marker per key ever polled.
pub async fn run_marker_janitor(
    kv: Arc<dyn KeyValueStore>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match kv.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "Swept expired dedup markers"),
                Err(e) => warn!(error = %e, "Dedup marker sweep failed"),
            },
        }
    }

    trace!("Dedup marker janitor stopped");
}
