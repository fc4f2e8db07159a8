//! Bus subject names and subject-prefix classification.
//!
//! Two subject families exist:
//!
//! - `userinfo.*`: poll signals, per-account change events and the
//!   client-facing per-user change forward.
//! - `notifications.*`: user, job, job grade, system and mailbox topics.
//!
//! Streams only ever receive subjects from [`Topic`]; everything else is
//! internal plumbing between the poller and the retriever.

use crate::types::{AccountId, JobGrade, UserId};
use serde::{Deserialize, Serialize};

pub const USERINFO_PREFIX: &str = "userinfo";
pub const NOTIFICATIONS_PREFIX: &str = "notifications";

/// Subject poll requests are published on.
pub const POLL_SUBJECT: &str = "userinfo.poll";

/// Filter matching every per-account change subject.
pub const CHANGED_FILTER: &str = "userinfo.changed.*";

/// System-wide notification subject.
pub const SYSTEM_SUBJECT: &str = "notifications.system";

/// Per-account change subject written by the diff engine.
pub fn changed_subject(account_id: AccountId) -> String {
    format!("{}.changed.{}", USERINFO_PREFIX, account_id)
}

/// Client-facing per-user change subject written by the retriever.
pub fn user_info_subject(user_id: UserId) -> String {
    format!("{}.user.{}", USERINFO_PREFIX, user_id)
}

pub fn user_subject(user_id: UserId) -> String {
    format!("{}.user.{}", NOTIFICATIONS_PREFIX, user_id)
}

pub fn job_subject(job: &str) -> String {
    format!("{}.job.{}", NOTIFICATIONS_PREFIX, job)
}

pub fn job_grade_subject(job: &str, grade: JobGrade) -> String {
    format!("{}.jobgrade.{}.{}", NOTIFICATIONS_PREFIX, job, grade)
}

pub fn mailbox_subject(mailbox_id: u64) -> String {
    format!("{}.mailbox.{}", NOTIFICATIONS_PREFIX, mailbox_id)
}

/// Client-visible topic a stream message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    UserInfo,
    User,
    Job,
    JobGrade,
    System,
    Mailbox,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::UserInfo => "userinfo",
            Topic::User => "user",
            Topic::Job => "job",
            Topic::JobGrade => "jobgrade",
            Topic::System => "system",
            Topic::Mailbox => "mailbox",
        }
    }

    pub fn is_notification(&self) -> bool {
        !matches!(self, Topic::UserInfo)
    }
}

/// Classify a stream subject by its prefix.
///
/// Returns `None` for subjects that are not client-facing.
pub fn classify_subject(subject: &str) -> Option<Topic> {
    let mut parts = subject.split('.');
    let family = parts.next()?;
    let kind = parts.next()?;

    match (family, kind) {
        (USERINFO_PREFIX, "user") => Some(Topic::UserInfo),
        (NOTIFICATIONS_PREFIX, "user") => Some(Topic::User),
        (NOTIFICATIONS_PREFIX, "job") => Some(Topic::Job),
        (NOTIFICATIONS_PREFIX, "jobgrade") => Some(Topic::JobGrade),
        (NOTIFICATIONS_PREFIX, "system") => Some(Topic::System),
        (NOTIFICATIONS_PREFIX, "mailbox") => Some(Topic::Mailbox),
        _ => None,
    }
}
