//! VIGIL Test Utilities
//!
//! Centralized test infrastructure for the VIGIL workspace:
//! - Mock stores with failure injection
//! - Proptest generators for poll requests and user state
//! - Fixtures for users and session tokens
//! - Assertions for API error codes

pub use vigil_api::{
    ApiError, ApiResult, AuthConfig, ErrorCode, FixedClock, JwtSecret, NotificationStore,
    UserInfoRow, UserOverrides, UserStore,
};
pub use vigil_core::{
    AccountId, JobGrade, Notification, NotificationEvent, PollRequest, StoreError, UserId,
    UserInfo, UserStateRow,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use vigil_core::BusError;
use vigil_events::{BusResult, KeyValueStore};

// ============================================================================
// MOCK USER STORE
// ============================================================================

/// In-memory [`UserStore`] with per-row and whole-query failure injection.
#[derive(Debug, Default)]
pub struct MockUserStore {
    users: Mutex<HashMap<(AccountId, UserId), UserInfoRow>>,
    failing_rows: Mutex<HashSet<(AccountId, UserId)>>,
    overrides: Mutex<Vec<(AccountId, UserOverrides)>>,
    unavailable: AtomicBool,
    lookups: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl MockUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, row: UserInfoRow) -> Self {
        self.upsert_user(row);
        self
    }

    pub fn upsert_user(&self, row: UserInfoRow) {
        self.users.lock().insert((row.account_id, row.user_id), row);
    }

    /// Change a stored user's job. Returns false if the user is unknown.
    pub fn set_job(
        &self,
        account_id: AccountId,
        user_id: UserId,
        job: &str,
        job_grade: JobGrade,
    ) -> bool {
        match self.users.lock().get_mut(&(account_id, user_id)) {
            Some(row) => {
                row.job = job.to_string();
                row.job_grade = job_grade;
                true
            }
            None => false,
        }
    }

    /// Apply an arbitrary edit to a stored user.
    pub fn update_user(
        &self,
        account_id: AccountId,
        user_id: UserId,
        edit: impl FnOnce(&mut UserInfoRow),
    ) -> bool {
        match self.users.lock().get_mut(&(account_id, user_id)) {
            Some(row) => {
                edit(row);
                true
            }
            None => false,
        }
    }

    /// Make the batch lookup return a decode error for this row.
    pub fn fail_row(&self, account_id: AccountId, user_id: UserId) {
        self.failing_rows.lock().insert((account_id, user_id));
    }

    /// Make every query fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of single-user lookups served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn overrides(&self) -> Vec<(AccountId, UserOverrides)> {
        self.overrides.lock().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "mock store offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MockUserStore {
    async fn load_user_states(
        &self,
        requests: &[PollRequest],
    ) -> Result<Vec<Result<UserStateRow, StoreError>>, StoreError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let users = self.users.lock();
        let failing = self.failing_rows.lock();
        Ok(requests
            .iter()
            .filter_map(|request| {
                let key = (request.account_id, request.user_id);
                let row = users.get(&key)?;
                if failing.contains(&key) {
                    return Some(Err(StoreError::InvalidRow {
                        table: "users".to_string(),
                        column: "job_grade".to_string(),
                        reason: "injected failure".to_string(),
                    }));
                }
                Some(Ok(UserStateRow {
                    account_id: row.account_id,
                    user_id: row.user_id,
                    job: row.job.clone(),
                    job_grade: row.job_grade,
                }))
            })
            .collect())
    }

    async fn get_user_info(
        &self,
        user_id: UserId,
        account_id: AccountId,
    ) -> Result<Option<UserInfoRow>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.users.lock().get(&(account_id, user_id)).cloned())
    }

    async fn get_user_info_without_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserInfoRow>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self
            .users
            .lock()
            .values()
            .find(|row| row.user_id == user_id)
            .cloned())
    }

    async fn set_user_overrides(
        &self,
        account_id: AccountId,
        overrides: &UserOverrides,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut users = self.users.lock();
        let mut found = false;
        for row in users.values_mut().filter(|row| row.account_id == account_id) {
            row.superuser = overrides.superuser;
            row.override_job = overrides.job.clone();
            row.override_job_grade = overrides.job_grade;
            found = true;
        }
        if !found {
            return Err(StoreError::WriteFailed {
                table: "accounts".to_string(),
                reason: format!("account {} not found", account_id),
            });
        }
        self.overrides.lock().push((account_id, overrides.clone()));
        Ok(())
    }
}

// ============================================================================
// MOCK NOTIFICATION STORE
// ============================================================================

/// In-memory [`NotificationStore`].
#[derive(Debug, Default)]
pub struct MockNotificationStore {
    unread: Mutex<HashMap<UserId, i64>>,
    mailboxes: Mutex<HashMap<UserId, Vec<u64>>>,
    unavailable: AtomicBool,
    count_queries: AtomicUsize,
}

impl MockNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unread(&self, user_id: UserId, count: i64) {
        self.unread.lock().insert(user_id, count);
    }

    pub fn set_mailboxes(&self, user_id: UserId, mailboxes: Vec<u64>) {
        self.mailboxes.lock().insert(user_id, mailboxes);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn count_queries(&self) -> usize {
        self.count_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationStore for MockNotificationStore {
    async fn unread_count(&self, user_id: UserId) -> Result<i64, StoreError> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "mock store offline".to_string(),
            });
        }
        Ok(self.unread.lock().get(&user_id).copied().unwrap_or(0))
    }

    async fn accessible_mailboxes(&self, user: &UserInfo) -> Result<Vec<u64>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "mock store offline".to_string(),
            });
        }
        Ok(self
            .mailboxes
            .lock()
            .get(&user.user_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// FAILING KEY/VALUE STORE
// ============================================================================

/// Key/value store that fails every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingKeyValue;

#[async_trait]
impl KeyValueStore for FailingKeyValue {
    async fn create(&self, key: &str, _value: Vec<u8>, _ttl: Duration) -> BusResult<bool> {
        Err(BusError::KeyValueFailed {
            key: key.to_string(),
            reason: "key/value store offline".to_string(),
        })
    }

    async fn get(&self, key: &str) -> BusResult<Option<Vec<u8>>> {
        Err(BusError::KeyValueFailed {
            key: key.to_string(),
            reason: "key/value store offline".to_string(),
        })
    }

    async fn delete(&self, key: &str) -> BusResult<bool> {
        Err(BusError::KeyValueFailed {
            key: key.to_string(),
            reason: "key/value store offline".to_string(),
        })
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for VIGIL types.

    use super::*;
    use proptest::prelude::*;

    /// Small id ranges so that generated requests collide often.
    pub fn arb_poll_request() -> impl Strategy<Value = PollRequest> {
        (1u64..4, 1i32..6).prop_map(|(account_id, user_id)| PollRequest::new(account_id, user_id))
    }

    pub fn arb_job() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("police".to_string()),
            Just("ambulance".to_string()),
            Just("mechanic".to_string()),
            Just("unemployed".to_string()),
        ]
    }

    pub fn arb_job_grade() -> impl Strategy<Value = JobGrade> {
        0i32..5
    }

    pub fn arb_state_row() -> impl Strategy<Value = UserStateRow> {
        (arb_poll_request(), arb_job(), arb_job_grade()).prop_map(|(request, job, job_grade)| {
            UserStateRow {
                account_id: request.account_id,
                user_id: request.user_id,
                job,
                job_grade,
            }
        })
    }

    /// Job/grade history of one user.
    pub fn arb_job_history(max_len: usize) -> impl Strategy<Value = Vec<(String, JobGrade)>> {
        prop::collection::vec((arb_job(), arb_job_grade()), 1..max_len.max(2))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use std::sync::Arc;

    /// Secret shared by fixture tokens.
    pub const TEST_JWT_SECRET: &str = "vigil_test_secret_for_session_tokens";

    /// 2024-01-01 00:00:00 UTC
    pub const TEST_NOW: i64 = 1704067200;

    /// An enabled user whose active character is `user_id`.
    pub fn user_row(
        account_id: AccountId,
        user_id: UserId,
        job: &str,
        job_grade: JobGrade,
    ) -> UserInfoRow {
        UserInfoRow {
            account_id,
            user_id,
            enabled: true,
            license: format!("license:{}", account_id),
            group: "user".to_string(),
            last_char_id: Some(user_id),
            job: job.to_string(),
            job_grade,
            superuser: false,
            override_job: None,
            override_job_grade: None,
        }
    }

    /// Auth config with a fixed secret and a clock pinned to [`TEST_NOW`].
    pub fn auth_config() -> AuthConfig {
        auth_config_at(TEST_NOW)
    }

    pub fn auth_config_at(now: i64) -> AuthConfig {
        let mut config = AuthConfig::default().with_clock(Arc::new(FixedClock(now)));
        if let Ok(secret) = JwtSecret::new(TEST_JWT_SECRET.to_string()) {
            config.jwt_secret = secret;
        }
        config
    }

    /// Encoded `notification` event.
    pub fn notification_payload(id: u64, title: &str) -> Vec<u8> {
        let event = NotificationEvent::Notification {
            notification: Notification {
                id,
                title: title.to_string(),
                content: None,
                category: Some("system".to_string()),
                created_at: chrono::Utc::now(),
            },
        };
        serde_json::to_vec(&event).unwrap_or_default()
    }

    /// Encoded `read_count` event.
    pub fn read_count_payload(count: i32) -> Vec<u8> {
        serde_json::to_vec(&NotificationEvent::ReadCount { count }).unwrap_or_default()
    }

    /// Session token for `user_id` of `account_id`, issued by the clock of `config`.
    pub fn session_token(
        config: &AuthConfig,
        account_id: AccountId,
        user_id: UserId,
    ) -> ApiResult<String> {
        vigil_api::generate_session_token(config, account_id, user_id)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on API results.

    use super::*;

    /// Assert that a result is an error with the given code.
    #[track_caller]
    pub fn assert_error_code<T: std::fmt::Debug>(result: &ApiResult<T>, code: ErrorCode) {
        match result {
            Err(e) => assert_eq!(e.code, code, "Wrong error code: {:?}", e),
            Ok(value) => panic!("Expected {:?} error, got Ok({:?})", code, value),
        }
    }

    /// Assert that a result is an authentication or authorization failure.
    #[track_caller]
    pub fn assert_auth_failure<T: std::fmt::Debug>(result: &ApiResult<T>) {
        match result {
            Err(e) => assert!(e.is_auth_failure(), "Expected auth failure, got: {:?}", e),
            Ok(value) => panic!("Expected auth failure, got Ok({:?})", value),
        }
    }
}
