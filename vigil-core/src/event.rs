//! Wire Event Types
//!
//! Payloads carried on the event bus and the client-facing stream envelope.
//! Everything is serialized as JSON.

use crate::subject::Topic;
use crate::types::{AccountId, JobGrade, Timestamp, UserId, UserSnapshot};
use serde::{Deserialize, Serialize};

// ============================================================================
// BUS PAYLOADS
// ============================================================================

/// A user's job or job grade changed. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoChanged {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub old_job: String,
    pub new_job: String,
    pub old_job_grade: JobGrade,
    pub new_job_grade: JobGrade,
    pub changed_at: Timestamp,
}

impl UserInfoChanged {
    /// Build a change event from two snapshots.
    pub fn between(
        account_id: AccountId,
        user_id: UserId,
        old: &UserSnapshot,
        new: &UserSnapshot,
        changed_at: Timestamp,
    ) -> Self {
        Self {
            account_id,
            user_id,
            old_job: old.job.clone(),
            new_job: new.job.clone(),
            old_job_grade: old.job_grade,
            new_job_grade: new.job_grade,
            changed_at,
        }
    }
}

/// A single notification as delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub created_at: Timestamp,
}

/// Payload published on `notifications.*` subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A new notification. Counts as one unread item.
    Notification { notification: Notification },

    /// The user marked `count` notifications as read.
    ReadCount { count: i32 },
}

// ============================================================================
// CLIENT STREAM
// ============================================================================

/// Data variant of a client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EnvelopeData {
    /// Client must refresh its session token.
    RefreshToken(bool),
    Notification(Notification),
    NotificationsReadCount(i32),
    UserInfoChanged(UserInfoChanged),
}

/// One message sent to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResponse {
    /// Unread notification count after applying this message.
    pub notification_count: i64,
    /// Client should reconnect after consuming this message.
    #[serde(default)]
    pub restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EnvelopeData>,
}

impl StreamResponse {
    /// Counter-only message (initial snapshot, resync).
    pub fn count(notification_count: i64) -> Self {
        Self {
            notification_count,
            restart: false,
            topic: None,
            data: None,
        }
    }

    /// Classified event envelope.
    pub fn event(notification_count: i64, topic: Topic, data: EnvelopeData) -> Self {
        Self {
            notification_count,
            restart: false,
            topic: Some(topic),
            data: Some(data),
        }
    }

    /// Session directive telling the client to refresh its token and reconnect.
    pub fn refresh(notification_count: i64) -> Self {
        Self {
            notification_count,
            restart: true,
            topic: None,
            data: Some(EnvelopeData::RefreshToken(true)),
        }
    }
}

/// Control message sent by a client on an open stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    Ping,
    /// Client reports which page it is looking at. Informational only.
    Focus { page: String },
}
