//! Change event subscriber.
//!
//! Consumes `userinfo.changed.*`, refreshes cached user info and forwards
//! every event to `userinfo.user.{userId}` where stream sessions pick it up.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::subject::{user_info_subject, CHANGED_FILTER};
use vigil_core::UserInfoChanged;
use vigil_events::{BusMessage, ConsumerConfig, EventBus, PullConsumer};

use super::UserInfoRetriever;
use crate::config::UserInfoConfig;
use crate::telemetry::metrics::with_metrics;

/// Handle one change message. Returns the decoded event, or `None` when
/// the payload was not a change event.
pub async fn handle_change_message(
    message: &BusMessage,
    retriever: &UserInfoRetriever,
    bus: &dyn EventBus,
) -> Option<UserInfoChanged> {
    if let Err(e) = message.ack().await {
        warn!(subject = %message.subject, error = %e, "Failed to ack change event");
    }

    let event = match serde_json::from_slice::<UserInfoChanged>(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            debug!(subject = %message.subject, error = %e, "Ignoring undecodable change event");
            return None;
        }
    };

    if retriever.apply_change(&event) {
        with_metrics(|m| m.record_change_event("applied"));
        debug!(
            account_id = event.account_id,
            user_id = event.user_id,
            new_job = %event.new_job,
            new_job_grade = event.new_job_grade,
            "Refreshed cached user info"
        );
    }

    let subject = user_info_subject(event.user_id);
    match bus.publish(&subject, message.payload.clone()).await {
        Ok(()) => with_metrics(|m| m.record_change_event("forwarded")),
        Err(e) => warn!(subject = %subject, error = %e, "Failed to forward change event"),
    }

    Some(event)
}

/// Consume change events until `shutdown` is cancelled.
pub async fn run_change_subscriber(
    retriever: Arc<UserInfoRetriever>,
    bus: Arc<dyn EventBus>,
    config: UserInfoConfig,
    shutdown: CancellationToken,
) {
    info!(durable = %config.durable, "Change subscriber started");
    let mut consumer: Option<Box<dyn PullConsumer>> = None;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if consumer.is_none() {
            let consumer_config =
                ConsumerConfig::new(config.durable.clone()).with_filter(CHANGED_FILTER);
            match bus.pull_consumer(consumer_config).await {
                Ok(created) => consumer = Some(created),
                Err(e) => {
                    error!(durable = %config.durable, error = %e, "Failed to create change consumer");
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
                    handle_change_message(message, &retriever, bus.as_ref()).await;
                }
            }
            Err(e) => {
                warn!(durable = %config.durable, error = %e, "Change fetch failed, re-creating consumer");
                consumer = None;
            }
        }
    }

    info!(durable = %config.durable, "Change subscriber stopped");
}
