//! Notification stream sessions.
//!
//! A session goes through three phases:
//!
//! - **Init**: authenticate, load the user, build the interest set and
//!   send the initial unread count.
//! - **Active**: four supervised loops (inbound reader, outbound writer,
//!   event fan-in, revalidation) share one cancellation token. The first
//!   loop to return decides the outcome and the rest are cancelled.
//! - **Terminal**: the per-session consumer is removed and the outcome is
//!   returned to the caller.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_core::StreamResponse;
use vigil_events::EventBus;

use super::counter::UnreadCounter;
use super::interest::InterestSet;
use super::loops::{
    event_fan_in, inbound_reader, outbound_writer, session_revalidation, FanIn, LoopResult,
    Revalidation,
};
use super::transport::{RequestContext, StreamSink, StreamSource};
use crate::auth::{extract_bearer, validate_session_token, AuthConfig};
use crate::config::StreamConfig;
use crate::constants::STREAM_DURABLE_PREFIX;
use crate::db::NotificationStore;
use crate::error::{ApiError, ApiResult};
use crate::telemetry::metrics::with_metrics;
use crate::userinfo::UserInfoRetriever;

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its side.
    ClientClosed,
    /// The request context or server shutdown cancelled the session.
    Cancelled,
    /// The client was told to refresh its token and reconnect.
    Restart,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::ClientClosed => "client_closed",
            SessionEnd::Cancelled => "cancelled",
            SessionEnd::Restart => "restart",
        }
    }
}

/// Tracks the active stream gauge for one session.
struct ActiveStream {
    reason: &'static str,
}

impl ActiveStream {
    fn open() -> Self {
        with_metrics(|m| m.stream_opened());
        Self { reason: "error" }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        let reason = self.reason;
        with_metrics(|m| m.stream_closed(reason));
    }
}

/// Serves notification streams to authenticated clients.
#[derive(Clone)]
pub struct NotificationStreamer {
    retriever: Arc<UserInfoRetriever>,
    notifications: Arc<dyn NotificationStore>,
    bus: Arc<dyn EventBus>,
    auth: AuthConfig,
    config: StreamConfig,
}

impl NotificationStreamer {
    pub fn new(
        retriever: Arc<UserInfoRetriever>,
        notifications: Arc<dyn NotificationStore>,
        bus: Arc<dyn EventBus>,
        auth: AuthConfig,
        config: StreamConfig,
    ) -> Self {
        Self {
            retriever,
            notifications,
            bus,
            auth,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Run one session to completion.
    ///
    /// Authentication failures are returned before anything is written.
    /// Errors from the active phase end the session and are returned as is.
    pub async fn stream(
        &self,
        ctx: RequestContext,
        source: Box<dyn StreamSource>,
        mut sink: Box<dyn StreamSink>,
    ) -> ApiResult<SessionEnd> {
        // ---- Init ----------------------------------------------------------
        let token = extract_bearer(&ctx.token)?;
        let claims = validate_session_token(&self.auth, token)?;

        let info = match self
            .retriever
            .get_user_info(claims.user_id, claims.account_id)
            .await?
        {
            Some(info) if info.enabled => info,
            Some(_) => return Err(ApiError::unauthorized("Account is disabled")),
            None => return Err(ApiError::unauthorized("Unknown user")),
        };

        let mailboxes = self.notifications.accessible_mailboxes(&info).await?;
        let interest = InterestSet::build(&info, &mailboxes);
        let unread = self.notifications.unread_count(info.user_id).await?;
        let counter = Arc::new(UnreadCounter::new(unread));

        let mut active = ActiveStream::open();

        if claims.expires_within(self.config.token_refresh_window_secs, self.auth.clock.as_ref()) {
            sink.send(StreamResponse::refresh(counter.get())).await?;
            active.reason = SessionEnd::Restart.as_str();
            return Ok(SessionEnd::Restart);
        }
        sink.send(StreamResponse::count(counter.get())).await?;

        // ---- Active --------------------------------------------------------
        let session_id = Uuid::now_v7();
        let durable = format!("{}-{}", STREAM_DURABLE_PREFIX, session_id);
        let cancel = ctx.cancel.child_token();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));

        let fan_in = FanIn {
            bus: self.bus.clone(),
            durable: durable.clone(),
            filters: interest.subjects().to_vec(),
            counter: counter.clone(),
            outbound: outbound_tx.clone(),
        };
        let (fan_in, consumer) = fan_in.start().await?;

        let revalidation = Revalidation {
            retriever: self.retriever.clone(),
            notifications: self.notifications.clone(),
            clock: self.auth.clock.clone(),
            claims: claims.clone(),
            initial: info,
            counter,
            outbound: outbound_tx,
        };

        info!(
            session_id = %session_id,
            account_id = claims.account_id,
            user_id = claims.user_id,
            subjects = interest.len(),
            "Stream session started"
        );

        let mut loops: JoinSet<(&'static str, LoopResult)> = JoinSet::new();
        {
            let cancel = cancel.clone();
            let session_id = session_id.to_string();
            loops.spawn(async move { ("inbound_reader", inbound_reader(source, session_id, cancel).await) });
        }
        {
            let cancel = cancel.clone();
            loops.spawn(async move { ("outbound_writer", outbound_writer(sink, outbound_rx, cancel).await) });
        }
        {
            let cancel = cancel.clone();
            let config = self.config.clone();
            loops.spawn(async move {
                ("event_fan_in", event_fan_in(fan_in, consumer, config, cancel).await)
            });
        }
        {
            let cancel = cancel.clone();
            let config = self.config.clone();
            loops.spawn(async move {
                ("session_revalidation", session_revalidation(revalidation, config, cancel).await)
            });
        }

        let outcome = match loops.join_next().await {
            Some(Ok((name, result))) => {
                debug!(session_id = %session_id, task = name, ok = result.is_ok(), "Session loop finished first");
                result
            }
            Some(Err(e)) => Err(ApiError::internal_error(format!("Session task failed: {}", e))),
            None => Ok(SessionEnd::Cancelled),
        };

        // ---- Terminal ------------------------------------------------------
        cancel.cancel();
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok((name, Err(e))) => {
                    debug!(session_id = %session_id, task = name, error = %e, "Session loop ended with error during shutdown");
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "Session task panicked"),
            }
        }

        if let Err(e) = self.bus.delete_consumer(&durable).await {
            warn!(durable = %durable, error = %e, "Failed to delete session consumer");
        }

        match &outcome {
            Ok(end) => {
                active.reason = end.as_str();
                info!(session_id = %session_id, outcome = end.as_str(), "Stream session ended");
            }
            Err(e) => {
                if e.is_auth_failure() {
                    active.reason = "unauthorized";
                }
                info!(session_id = %session_id, error = %e, "Stream session ended with error");
            }
        }

        outcome
    }
}
