//! VIGIL Core - Shared Types
//!
//! Identifiers, user state, wire events and error types shared by every
//! other crate in the workspace. This crate carries no runtime behaviour
//! beyond small pure helpers (subject construction and classification).

pub mod error;
pub mod event;
pub mod subject;
pub mod types;

pub use error::{
    BusError, CacheError, ConfigError, StoreError, VigilError, VigilResult,
};
pub use event::{
    EnvelopeData, Notification, NotificationEvent, StreamRequest, StreamResponse,
    UserInfoChanged,
};
pub use subject::{classify_subject, Topic};
pub use types::{
    AccountId, JobGrade, PollRequest, Timestamp, UserAccountKey, UserId, UserInfo, UserSnapshot,
    UserStateRow,
};
