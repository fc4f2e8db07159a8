//! The four loops that make up an active stream session.
//!
//! Each loop runs as its own task and returns a [`LoopResult`]. The
//! session supervisor treats the first return as the session outcome and
//! cancels the others through the shared token.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vigil_core::{
    classify_subject, EnvelopeData, NotificationEvent, StreamResponse, Topic, UserInfo,
    UserInfoChanged,
};
use vigil_events::{BusMessage, ConsumerConfig, DeliverPolicy, EventBus, PullConsumer};

use super::counter::UnreadCounter;
use super::session::SessionEnd;
use super::transport::{StreamSink, StreamSource};
use crate::auth::{JwtClock, SessionClaims};
use crate::config::StreamConfig;
use crate::db::NotificationStore;
use crate::error::{ApiError, ApiResult};
use crate::telemetry::metrics::with_metrics;
use crate::userinfo::UserInfoRetriever;

/// Result of one session loop.
pub type LoopResult = ApiResult<SessionEnd>;

// ============================================================================
// INBOUND READER
// ============================================================================

/// Drain client control messages until the client closes or errors.
pub async fn inbound_reader(
    mut source: Box<dyn StreamSource>,
    session_id: String,
    cancel: CancellationToken,
) -> LoopResult {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            next = source.recv() => next,
        };

        match next {
            None => {
                debug!(session_id = %session_id, "Client closed stream");
                return Ok(SessionEnd::ClientClosed);
            }
            Some(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "Client stream failed");
                return Err(e);
            }
            Some(Ok(request)) => {
                trace!(session_id = %session_id, request = ?request, "Client control message");
            }
        }
    }
}

// ============================================================================
// OUTBOUND WRITER
// ============================================================================

/// Sole writer to the client. Queued messages are flushed on cancellation
/// so a final directive still reaches the client.
pub async fn outbound_writer(
    mut sink: Box<dyn StreamSink>,
    mut outbound: mpsc::Receiver<StreamResponse>,
    cancel: CancellationToken,
) -> LoopResult {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = cancel.cancelled() => break,
        };

        match next {
            Some(response) => write(sink.as_mut(), response).await?,
            None => return Ok(SessionEnd::Cancelled),
        }
    }

    outbound.close();
    while let Ok(response) = outbound.try_recv() {
        write(sink.as_mut(), response).await?;
    }
    Ok(SessionEnd::Cancelled)
}

async fn write(sink: &mut dyn StreamSink, response: StreamResponse) -> ApiResult<()> {
    let topic = response.topic.map(|t| t.as_str()).unwrap_or("session");
    sink.send(response).await?;
    with_metrics(|m| m.record_envelope(topic));
    Ok(())
}

// ============================================================================
// EVENT FAN-IN
// ============================================================================

/// Turn one bus message into a client envelope, updating the counter.
///
/// Returns `None` for subjects outside the client topics and for payloads
/// that do not decode.
pub fn envelope_for(message: &BusMessage, counter: &UnreadCounter) -> Option<StreamResponse> {
    let topic = classify_subject(&message.subject)?;

    let data = if topic == Topic::UserInfo {
        match serde_json::from_slice::<UserInfoChanged>(&message.payload) {
            Ok(event) => EnvelopeData::UserInfoChanged(event),
            Err(e) => {
                debug!(subject = %message.subject, error = %e, "Dropping undecodable user info event");
                return None;
            }
        }
    } else {
        match serde_json::from_slice::<NotificationEvent>(&message.payload) {
            Ok(NotificationEvent::Notification { notification }) => {
                counter.increment();
                EnvelopeData::Notification(notification)
            }
            Ok(NotificationEvent::ReadCount { count }) => {
                counter.decrease_by(i64::from(count));
                EnvelopeData::NotificationsReadCount(count)
            }
            Err(e) => {
                debug!(subject = %message.subject, error = %e, "Dropping undecodable notification");
                return None;
            }
        }
    };

    Some(StreamResponse::event(counter.get(), topic, data))
}

/// Everything the fan-in loop needs to (re)create its consumer.
pub struct FanIn {
    pub bus: Arc<dyn EventBus>,
    pub durable: String,
    pub filters: Vec<String>,
    pub counter: Arc<UnreadCounter>,
    pub outbound: mpsc::Sender<StreamResponse>,
}

impl FanIn {
    async fn consumer(&self) -> ApiResult<Box<dyn PullConsumer>> {
        let config = ConsumerConfig::new(self.durable.clone())
            .with_filters(self.filters.iter().cloned())
            .with_deliver_policy(DeliverPolicy::New);
        Ok(self.bus.pull_consumer(config).await?)
    }

    /// Create the consumer before the loop starts so no event published
    /// after session setup is missed.
    pub async fn start(self) -> ApiResult<(Self, Box<dyn PullConsumer>)> {
        let consumer = self.consumer().await?;
        Ok((self, consumer))
    }
}

/// Pull events for the interest set and forward them to the writer.
///
/// A failed fetch re-creates the consumer immediately.
pub async fn event_fan_in(
    fan_in: FanIn,
    mut consumer: Box<dyn PullConsumer>,
    config: StreamConfig,
    cancel: CancellationToken,
) -> LoopResult {
    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            fetched = consumer.fetch(config.fetch_batch, config.fetch_wait) => fetched,
        };

        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) => {
                warn!(durable = %fan_in.durable, error = %e, "Stream fetch failed, re-creating consumer");
                consumer = fan_in.consumer().await?;
                continue;
            }
        };

        for message in messages {
            if let Err(e) = message.ack().await {
                warn!(subject = %message.subject, error = %e, "Failed to ack stream event");
            }

            let Some(response) = envelope_for(&message, &fan_in.counter) else {
                continue;
            };
            if fan_in.outbound.send(response).await.is_err() {
                return Ok(SessionEnd::Cancelled);
            }
        }
    }
}

// ============================================================================
// SESSION REVALIDATION
// ============================================================================

/// Inputs of the revalidation loop.
pub struct Revalidation {
    pub retriever: Arc<UserInfoRetriever>,
    pub notifications: Arc<dyn NotificationStore>,
    pub clock: Arc<dyn JwtClock>,
    pub claims: SessionClaims,
    pub initial: UserInfo,
    pub counter: Arc<UnreadCounter>,
    pub outbound: mpsc::Sender<StreamResponse>,
}

/// What one revalidation pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Session stays open; carries the fresh user info.
    Continue(UserInfo),
    /// Client must refresh its token and reconnect.
    Restart,
    /// The store could not be reached; try again next tick.
    Skipped,
}

/// Check a freshly fetched user against the session it opened.
pub fn judge(
    fetched: Option<UserInfo>,
    previous: &UserInfo,
    claims: &SessionClaims,
    clock: &dyn JwtClock,
    config: &StreamConfig,
) -> ApiResult<Verdict> {
    let Some(info) = fetched else {
        return Err(ApiError::unauthorized("User no longer exists"));
    };
    if !info.enabled {
        return Err(ApiError::unauthorized("Account is disabled"));
    }

    if config.character_lock && !info.can_be_superuser {
        if let Some(active) = info.last_char_id {
            if active != claims.user_id {
                return Err(ApiError::character_lock_violation(claims.user_id, active));
            }
        }
    }

    if claims.expires_within(config.token_refresh_window_secs, clock)
        || info.differs_materially(previous)
    {
        return Ok(Verdict::Restart);
    }

    Ok(Verdict::Continue(info))
}

/// Re-check the session every `revalidate_interval` and resync the unread
/// counter every `resync_every_ticks` ticks.
pub async fn session_revalidation(
    revalidation: Revalidation,
    config: StreamConfig,
    cancel: CancellationToken,
) -> LoopResult {
    let Revalidation {
        retriever,
        notifications,
        clock,
        claims,
        initial,
        counter,
        outbound,
    } = revalidation;

    let mut ticker = interval(config.revalidate_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut last = initial;
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            _ = ticker.tick() => {}
        }

        let verdict = match retriever.get_user_info(claims.user_id, claims.account_id).await {
            Ok(fetched) => judge(fetched, &last, &claims, clock.as_ref(), &config)?,
            Err(e) => {
                warn!(user_id = claims.user_id, error = %e, "Session revalidation lookup failed");
                Verdict::Skipped
            }
        };

        match verdict {
            Verdict::Restart => {
                debug!(user_id = claims.user_id, "Session needs restart");
                // The writer flushes this after cancellation.
                let _ = outbound.send(StreamResponse::refresh(counter.get())).await;
                return Ok(SessionEnd::Restart);
            }
            Verdict::Continue(info) => last = info,
            Verdict::Skipped => {}
        }

        ticks = ticks.wrapping_add(1);
        if ticks % config.resync_every_ticks.max(1) == 0 {
            match notifications.unread_count(claims.user_id).await {
                Ok(count) => {
                    let count = counter.set(count);
                    if outbound.send(StreamResponse::count(count)).await.is_err() {
                        return Ok(SessionEnd::Cancelled);
                    }
                }
                Err(e) => {
                    warn!(user_id = claims.user_id, error = %e, "Unread count resync failed");
                }
            }
        }
    }
}
