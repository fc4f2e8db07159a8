//! Change detection over batch lookup rows.
//!
//! The engine remembers the last observed `(job, job_grade)` per
//! `(account, user)` and reports a [`UserInfoChanged`] only on a genuine
//! transition. The first sighting of a user is silent.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use vigil_core::subject::changed_subject;
use vigil_core::{
    AccountId, BusError, Timestamp, UserId, UserInfoChanged, UserSnapshot, UserStateRow,
};
use vigil_events::EventBus;

/// Last-seen snapshots, keyed by account then user.
#[derive(Debug, Default)]
pub struct DiffEngine {
    snapshots: Mutex<HashMap<AccountId, HashMap<UserId, UserSnapshot>>>,
}

/// Error raised by [`DiffEngine::apply`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("Failed to encode change event: {0}")]
    Encode(String),

    #[error(transparent)]
    Publish(#[from] BusError),
}

impl DiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `row` and return the change it represents, if any.
    pub fn observe(&self, row: &UserStateRow, at: Timestamp) -> Option<UserInfoChanged> {
        let current = row.snapshot();
        let mut snapshots = self.snapshots.lock();
        let users = snapshots.entry(row.account_id).or_default();

        match users.get_mut(&row.user_id) {
            None => {
                users.insert(row.user_id, current);
                None
            }
            Some(previous) if *previous == current => None,
            Some(previous) => {
                let event =
                    UserInfoChanged::between(row.account_id, row.user_id, previous, &current, at);
                *previous = current;
                Some(event)
            }
        }
    }

    /// Observe `row` and publish the resulting change to
    /// `userinfo.changed.{account}`.
    ///
    /// Publishing happens after the snapshot lock is released. If it fails,
    /// the previous snapshot is restored so the next batch reports the
    /// change again.
    pub async fn apply(
        &self,
        bus: &dyn EventBus,
        row: &UserStateRow,
    ) -> Result<Option<UserInfoChanged>, ApplyError> {
        let Some(event) = self.observe(row, Utc::now()) else {
            return Ok(None);
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                self.restore(&event);
                return Err(ApplyError::Encode(e.to_string()));
            }
        };

        let subject = changed_subject(row.account_id);
        if let Err(e) = bus.publish(&subject, payload).await {
            self.restore(&event);
            return Err(e.into());
        }

        debug!(
            account_id = event.account_id,
            user_id = event.user_id,
            old_job = %event.old_job,
            new_job = %event.new_job,
            old_job_grade = event.old_job_grade,
            new_job_grade = event.new_job_grade,
            "Published user info change"
        );
        Ok(Some(event))
    }

    /// Put the pre-change snapshot back, unless a newer row already moved it.
    fn restore(&self, event: &UserInfoChanged) {
        let mut snapshots = self.snapshots.lock();
        if let Some(snapshot) = snapshots
            .get_mut(&event.account_id)
            .and_then(|users| users.get_mut(&event.user_id))
        {
            if snapshot.job == event.new_job && snapshot.job_grade == event.new_job_grade {
                *snapshot = UserSnapshot::new(event.old_job.clone(), event.old_job_grade);
            }
        }
    }

    pub fn snapshot(&self, account_id: AccountId, user_id: UserId) -> Option<UserSnapshot> {
        self.snapshots
            .lock()
            .get(&account_id)
            .and_then(|users| users.get(&user_id))
            .cloned()
    }

    /// Number of tracked users across all accounts.
    pub fn tracked(&self) -> usize {
        self.snapshots.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_core::subject::CHANGED_FILTER;
    use vigil_events::{ConsumerConfig, InMemoryEventBus};

    fn row(account_id: AccountId, user_id: UserId, job: &str, grade: i32) -> UserStateRow {
        UserStateRow {
            account_id,
            user_id,
            job: job.to_string(),
            job_grade: grade,
        }
    }

    #[test]
    fn test_first_observation_is_silent() {
        let engine = DiffEngine::new();
        assert!(engine.observe(&row(1, 5, "police", 2), Utc::now()).is_none());
        assert_eq!(engine.snapshot(1, 5), Some(UserSnapshot::new("police", 2)));
        assert_eq!(engine.tracked(), 1);
    }

    #[test]
    fn test_scenario_grade_promotion_emits_once() {
        let engine = DiffEngine::new();
        assert!(engine.observe(&row(1, 5, "police", 2), Utc::now()).is_none());

        let event = engine.observe(&row(1, 5, "police", 3), Utc::now());
        let event = match event {
            Some(event) => event,
            None => panic!("promotion should produce a change"),
        };
        assert_eq!(event.account_id, 1);
        assert_eq!(event.user_id, 5);
        assert_eq!(event.old_job, "police");
        assert_eq!(event.new_job, "police");
        assert_eq!(event.old_job_grade, 2);
        assert_eq!(event.new_job_grade, 3);

        assert!(engine.observe(&row(1, 5, "police", 3), Utc::now()).is_none());
        assert_eq!(engine.snapshot(1, 5), Some(UserSnapshot::new("police", 3)));
    }

    #[test]
    fn test_accounts_are_independent() {
        let engine = DiffEngine::new();
        engine.observe(&row(1, 5, "police", 2), Utc::now());
        assert!(engine.observe(&row(2, 5, "ambulance", 1), Utc::now()).is_none());
        assert_eq!(engine.tracked(), 2);
        assert_eq!(engine.snapshot(1, 5), Some(UserSnapshot::new("police", 2)));
        assert_eq!(engine.snapshot(2, 5), Some(UserSnapshot::new("ambulance", 1)));
    }

    #[tokio::test]
    async fn test_apply_publishes_to_account_subject() -> Result<(), ApplyError> {
        let bus = InMemoryEventBus::new();
        let mut consumer = bus
            .pull_consumer(ConsumerConfig::new("test").with_filter(CHANGED_FILTER))
            .await?;
        let engine = DiffEngine::new();

        assert!(engine.apply(&bus, &row(9, 5, "police", 2)).await?.is_none());
        assert!(engine.apply(&bus, &row(9, 5, "mechanic", 0)).await?.is_some());

        let messages = consumer.fetch(10, Duration::from_millis(100)).await?;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].subject, "userinfo.changed.9");
        let event: UserInfoChanged = serde_json::from_slice(&messages[0].payload)
            .map_err(|e| ApplyError::Encode(e.to_string()))?;
        assert_eq!(event.new_job, "mechanic");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_publish_restores_snapshot() -> Result<(), ApplyError> {
        let bus = InMemoryEventBus::new();
        let engine = DiffEngine::new();
        engine.apply(&bus, &row(1, 5, "police", 2)).await?;

        bus.close();
        let result = engine.apply(&bus, &row(1, 5, "police", 3)).await;
        assert!(matches!(result, Err(ApplyError::Publish(_))));
        assert_eq!(engine.snapshot(1, 5), Some(UserSnapshot::new("police", 2)));

        // Once the bus recovers, the same transition is reported again.
        let bus = InMemoryEventBus::new();
        assert!(engine.apply(&bus, &row(1, 5, "police", 3)).await?.is_some());
        Ok(())
    }
}
