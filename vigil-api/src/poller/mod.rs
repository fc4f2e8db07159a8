//! User State Poller
//!
//! Turns "refresh me" signals on `userinfo.poll` into change events on
//! `userinfo.changed.{accountId}`:
//!
//! 1. [`intake`] consumes poll requests and suppresses duplicates with a
//!    TTL marker in the key/value store.
//! 2. [`batch`] drains the pending set on a fixed interval and issues one
//!    combined lookup.
//! 3. [`diff`] compares each row with the last snapshot and publishes
//!    genuine transitions.

pub mod batch;
pub mod diff;
pub mod intake;

pub use batch::{process_batch, run_batch_loop, BatchError, BatchReport, RowError};
pub use diff::{ApplyError, DiffEngine};
pub use intake::{
    handle_poll_message, run_intake, run_marker_janitor, IntakeOutcome, PendingPolls,
};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil_core::subject::POLL_SUBJECT;
use vigil_core::PollRequest;
use vigil_events::{EventBus, KeyValueStore};

use crate::config::PollerConfig;
use crate::db::UserStore;
use crate::error::{ApiError, ApiResult};

/// Intake plus batch processor sharing one pending set and diff engine.
pub struct Poller {
    store: Arc<dyn UserStore>,
    bus: Arc<dyn EventBus>,
    kv: Arc<dyn KeyValueStore>,
    config: PollerConfig,
    pending: PendingPolls,
    diff: Arc<DiffEngine>,
}

impl Poller {
    /// Build a poller. Fails if the configuration is inconsistent.
    pub fn new(
        store: Arc<dyn UserStore>,
        bus: Arc<dyn EventBus>,
        kv: Arc<dyn KeyValueStore>,
        config: PollerConfig,
    ) -> ApiResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            bus,
            kv,
            config,
            pending: PendingPolls::new(),
            diff: Arc::new(DiffEngine::new()),
        })
    }

    pub fn pending(&self) -> &PendingPolls {
        &self.pending
    }

    pub fn diff(&self) -> &Arc<DiffEngine> {
        &self.diff
    }

    /// Run intake and batch loops until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            batch_interval_secs = self.config.batch_interval.as_secs_f64(),
            dedup_ttl_secs = self.config.dedup_ttl.as_secs_f64(),
            "Poller starting"
        );

        let intake = run_intake(
            self.bus.clone(),
            self.kv.clone(),
            self.pending.clone(),
            self.config.clone(),
            shutdown.clone(),
        );
        let batches = run_batch_loop(
            self.store.clone(),
            self.bus.clone(),
            self.diff.clone(),
            self.pending.clone(),
            self.config.batch_interval,
            shutdown,
        );

        tokio::join!(intake, batches);
        info!("Poller stopped");
    }
}

/// Publish a poll request for `request` to `userinfo.poll`.
pub async fn request_poll(bus: &dyn EventBus, request: PollRequest) -> ApiResult<()> {
    let payload = serde_json::to_vec(&request)?;
    bus.publish(POLL_SUBJECT, payload)
        .await
        .map_err(|e| ApiError::bus_error(format!("Failed to publish poll request: {}", e)))
}
