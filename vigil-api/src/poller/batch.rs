//! Interval-driven batch processor.
//!
//! On every tick the pending poll set is swapped for an empty one and all
//! drained requests are resolved by one combined store lookup. Rows go
//! through the diff engine one by one; a bad row is recorded and skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{BusError, PollRequest, StoreError, UserAccountKey};
use vigil_events::EventBus;

use super::diff::{ApplyError, DiffEngine};
use super::intake::PendingPolls;
use crate::db::UserStore;
use crate::telemetry::metrics::with_metrics;

// ============================================================================
// ERRORS AND REPORTS
// ============================================================================

/// Failure of a single row inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error("Row could not be decoded: {0}")]
    Decode(#[from] StoreError),

    #[error("Change for {key} could not be published: {source}")]
    Publish { key: UserAccountKey, source: BusError },

    #[error("Change for {key} could not be encoded: {reason}")]
    Encode { key: UserAccountKey, reason: String },
}

/// Row failures collected over one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{} row(s) failed in batch", .failures.len())]
pub struct BatchError {
    pub failures: Vec<RowError>,
}

impl BatchError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }
}

/// Outcome of one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Poll requests drained from the pending set
    pub requested: usize,
    /// Rows returned by the store
    pub rows: usize,
    /// Change events published
    pub events: usize,
    pub errors: BatchError,
}

// ============================================================================
// BATCH PASS
// ============================================================================

/// Drain `pending` and process everything in it once.
///
/// An empty pending set skips the lookup entirely. A failed lookup drops
/// the drained requests; callers poll again on their next signal.
pub async fn process_batch(
    store: &dyn UserStore,
    bus: &dyn EventBus,
    diff: &DiffEngine,
    pending: &PendingPolls,
) -> Result<BatchReport, StoreError> {
    let drained = pending.take_all();
    if drained.is_empty() {
        return Ok(BatchReport::default());
    }

    let requests: Vec<PollRequest> = drained.into_values().collect();
    let mut report = BatchReport {
        requested: requests.len(),
        ..BatchReport::default()
    };

    let rows = store.load_user_states(&requests).await?;
    report.rows = rows.len();

    for row in rows {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                report.errors.failures.push(RowError::Decode(e));
                continue;
            }
        };

        let key = UserAccountKey::new(row.user_id, row.account_id);
        match diff.apply(bus, &row).await {
            Ok(Some(_)) => {
                report.events += 1;
                with_metrics(|m| m.record_change_event("published"));
            }
            Ok(None) => {}
            Err(ApplyError::Publish(source)) => {
                report.errors.failures.push(RowError::Publish { key, source });
            }
            Err(ApplyError::Encode(reason)) => {
                report.errors.failures.push(RowError::Encode { key, reason });
            }
        }
    }

    Ok(report)
}

// ============================================================================
// TICKER LOOP
// ============================================================================

/// Run [`process_batch`] every `batch_interval` until `shutdown` is cancelled.
pub async fn run_batch_loop(
    store: Arc<dyn UserStore>,
    bus: Arc<dyn EventBus>,
    diff: Arc<DiffEngine>,
    pending: PendingPolls,
    batch_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(batch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(interval_secs = batch_interval.as_secs_f64(), "Batch processor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let started = Instant::now();
                match process_batch(store.as_ref(), bus.as_ref(), &diff, &pending).await {
                    Ok(report) if report.requested == 0 => {}
                    Ok(report) => {
                        let elapsed = started.elapsed().as_secs_f64();
                        let failed = report.errors.len();
                        with_metrics(|m| m.record_batch(report.rows.saturating_sub(failed), failed, elapsed));

                        if !report.errors.is_empty() {
                            for failure in &report.errors.failures {
                                warn!(error = %failure, "Batch row failed");
                            }
                            warn!(error = %report.errors, "Batch finished with row errors");
                        }
                        debug!(
                            requested = report.requested,
                            rows = report.rows,
                            events = report.events,
                            errors = failed,
                            elapsed_secs = elapsed,
                            "Batch processed"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Batch lookup failed, dropping batch");
                    }
                }
            }
        }
    }

    info!("Batch processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{UserInfoRow, UserOverrides};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use vigil_core::subject::CHANGED_FILTER;
    use vigil_core::{AccountId, UserId, UserStateRow};
    use vigil_events::{ConsumerConfig, InMemoryEventBus};

    /// Store returning a scripted sequence of batch results.
    #[derive(Default)]
    struct ScriptedStore {
        batches: Mutex<Vec<Result<Vec<Result<UserStateRow, StoreError>>, StoreError>>>,
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedStore {
        fn push(&self, batch: Result<Vec<Result<UserStateRow, StoreError>>, StoreError>) {
            self.batches.lock().insert(0, batch);
        }
    }

    #[async_trait]
    impl UserStore for ScriptedStore {
        async fn load_user_states(
            &self,
            requests: &[PollRequest],
        ) -> Result<Vec<Result<UserStateRow, StoreError>>, StoreError> {
            self.calls.lock().push(requests.len());
            self.batches.lock().pop().unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn get_user_info(
            &self,
            _user_id: UserId,
            _account_id: AccountId,
        ) -> Result<Option<UserInfoRow>, StoreError> {
            Ok(None)
        }

        async fn get_user_info_without_account(
            &self,
            _user_id: UserId,
        ) -> Result<Option<UserInfoRow>, StoreError> {
            Ok(None)
        }

        async fn set_user_overrides(
            &self,
            _account_id: AccountId,
            _overrides: &UserOverrides,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn row(account_id: AccountId, user_id: UserId, job: &str, grade: i32) -> UserStateRow {
        UserStateRow {
            account_id,
            user_id,
            job: job.to_string(),
            job_grade: grade,
        }
    }

    fn bad_row() -> StoreError {
        StoreError::InvalidRow {
            table: "users".to_string(),
            column: "job_grade".to_string(),
            reason: "null".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_pending_skips_lookup() -> Result<(), StoreError> {
        let store = ScriptedStore::default();
        let bus = InMemoryEventBus::new();
        let report =
            process_batch(&store, &bus, &DiffEngine::new(), &PendingPolls::new()).await?;
        assert_eq!(report, BatchReport::default());
        assert!(store.calls.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_row_does_not_stop_neighbours() -> Result<(), StoreError> {
        let store = ScriptedStore::default();
        let bus = InMemoryEventBus::new();
        let diff = DiffEngine::new();
        let pending = PendingPolls::new();

        for user in 1..=3 {
            pending.insert(PollRequest::new(1, user));
        }
        store.push(Ok(vec![Ok(row(1, 1, "police", 1)), Err(bad_row()), Ok(row(1, 3, "police", 1))]));
        let report = process_batch(&store, &bus, &diff, &pending).await?;
        assert_eq!(report.requested, 3);
        assert_eq!(report.rows, 3);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors.failures[0], RowError::Decode(_)));
        assert_eq!(diff.tracked(), 2);
        assert!(pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_scenario_poll_to_change_event() -> Result<(), Box<dyn std::error::Error>> {
        let store = ScriptedStore::default();
        let bus = InMemoryEventBus::new();
        let diff = DiffEngine::new();
        let pending = PendingPolls::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("watch").with_filter(CHANGED_FILTER))
            .await?;

        pending.insert(PollRequest::new(1, 5));
        store.push(Ok(vec![Ok(row(1, 5, "police", 2))]));
        let first = process_batch(&store, &bus, &diff, &pending).await?;
        assert_eq!(first.events, 0);

        pending.insert(PollRequest::new(1, 5));
        store.push(Ok(vec![Ok(row(1, 5, "police", 3))]));
        let second = process_batch(&store, &bus, &diff, &pending).await?;
        assert_eq!(second.events, 1);

        let messages = consumer.fetch(10, Duration::from_millis(100)).await?;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "userinfo.changed.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_failure_drops_batch() {
        let store = ScriptedStore::default();
        let bus = InMemoryEventBus::new();
        let pending = PendingPolls::new();
        pending.insert(PollRequest::new(1, 5));
        store.push(Err(StoreError::Unavailable {
            reason: "pool exhausted".to_string(),
        }));

        let result = process_batch(&store, &bus, &DiffEngine::new(), &pending).await;
        assert!(result.is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_recorded_per_row() -> Result<(), StoreError> {
        let store = ScriptedStore::default();
        let bus = InMemoryEventBus::new();
        let diff = DiffEngine::new();
        let pending = PendingPolls::new();

        pending.insert(PollRequest::new(1, 5));
        store.push(Ok(vec![Ok(row(1, 5, "police", 2))]));
        process_batch(&store, &bus, &diff, &pending).await?;

        bus.close();
        pending.insert(PollRequest::new(1, 5));
        store.push(Ok(vec![Ok(row(1, 5, "police", 4))]));
        let report = process_batch(&store, &bus, &diff, &pending).await?;
        assert_eq!(report.events, 0);
        assert!(matches!(
            report.errors.failures.as_slice(),
            [RowError::Publish { key, .. }] if *key == UserAccountKey::new(5, 1)
        ));
        Ok(())
    }
}
