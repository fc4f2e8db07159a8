//! User state types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Account identifier (one account owns many characters/users).
pub type AccountId = u64;

/// User (character) identifier.
pub type UserId = i32;

/// Rank inside a job. Higher grades include the lower ones.
pub type JobGrade = i32;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Composite cache key for per-account user lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserAccountKey {
    pub user_id: UserId,
    pub account_id: AccountId,
}

impl UserAccountKey {
    pub fn new(user_id: UserId, account_id: AccountId) -> Self {
        Self {
            user_id,
            account_id,
        }
    }
}

impl fmt::Display for UserAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.user_id)
    }
}

// ============================================================================
// POLLING
// ============================================================================

/// Inbound "refresh me" signal for one user of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollRequest {
    pub account_id: AccountId,
    pub user_id: UserId,
}

impl PollRequest {
    pub fn new(account_id: AccountId, user_id: UserId) -> Self {
        Self {
            account_id,
            user_id,
        }
    }

    /// Key used for the distributed dedup marker, `accountId:userId`.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.account_id, self.user_id)
    }

    pub fn key(&self) -> UserAccountKey {
        UserAccountKey::new(self.user_id, self.account_id)
    }
}

/// Last observed job/grade pair for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub job: String,
    pub job_grade: JobGrade,
}

impl UserSnapshot {
    pub fn new(job: impl Into<String>, job_grade: JobGrade) -> Self {
        Self {
            job: job.into(),
            job_grade,
        }
    }
}

/// One row of the combined batch lookup (user state joined with account state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStateRow {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub job: String,
    pub job_grade: JobGrade,
}

impl UserStateRow {
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot::new(self.job.clone(), self.job_grade)
    }
}

// ============================================================================
// USER INFO
// ============================================================================

/// Resolved user information used by request handlers and streams.
///
/// `job`/`job_grade` already carry the superuser override when one applies;
/// the stored override values are kept alongside for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub enabled: bool,
    pub license: String,
    pub group: String,
    /// Character currently selected on the account.
    pub last_char_id: Option<UserId>,
    pub job: String,
    pub job_grade: JobGrade,
    pub can_be_superuser: bool,
    pub superuser: bool,
    pub override_job: Option<String>,
    pub override_job_grade: Option<JobGrade>,
}

impl UserInfo {
    pub fn key(&self) -> UserAccountKey {
        UserAccountKey::new(self.user_id, self.account_id)
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot::new(self.job.clone(), self.job_grade)
    }

    /// Whether a session opened with `previous` must be restarted to see `self`.
    ///
    /// Only fields that change the subject interest set or permissions count.
    pub fn differs_materially(&self, previous: &UserInfo) -> bool {
        self.job != previous.job
            || self.job_grade != previous.job_grade
            || self.superuser != previous.superuser
            || self.group != previous.group
            || self.enabled != previous.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> UserInfo {
        UserInfo {
            account_id: 1,
            user_id: 5,
            enabled: true,
            license: "license:abc".to_string(),
            group: "user".to_string(),
            last_char_id: Some(5),
            job: "police".to_string(),
            job_grade: 2,
            can_be_superuser: false,
            superuser: false,
            override_job: None,
            override_job_grade: None,
        }
    }

    #[test]
    fn test_dedup_key_format() {
        let req = PollRequest::new(12, 7);
        assert_eq!(req.dedup_key(), "12:7");
        assert_eq!(req.key(), UserAccountKey::new(7, 12));
        assert_eq!(req.key().to_string(), "12:7");
    }

    #[test]
    fn test_material_difference() {
        let base = info();
        let mut same = base.clone();
        same.last_char_id = Some(9);
        assert!(!same.differs_materially(&base));

        let mut promoted = base.clone();
        promoted.job_grade = 3;
        assert!(promoted.differs_materially(&base));

        let mut disabled = base.clone();
        disabled.enabled = false;
        assert!(disabled.differs_materially(&base));
    }
}
