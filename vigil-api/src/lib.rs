//! VIGIL API - Live User-State Synchronization
//!
//! This crate keeps user state flowing from the relational store to
//! connected clients:
//!
//! - [`poller`]: deduplicated poll intake, interval batch lookups and change
//!   detection publishing `userinfo.changed.{accountId}`.
//! - [`userinfo`]: cached user info retrieval with superuser resolution and a
//!   change subscriber that keeps the cache fresh.
//! - [`stream`]: per-client notification stream sessions.
//!
//! The event bus and key/value store come from `vigil-events`; the shared
//! cache from `vigil-cache`.

pub mod auth;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod poller;
pub mod state;
pub mod stream;
pub mod telemetry;
pub mod userinfo;

// Re-export commonly used types
pub use auth::{
    extract_bearer, generate_session_token, validate_session_token, AuthConfig, FixedClock,
    JwtClock, JwtSecret, SessionClaims, SystemClock,
};
pub use config::{AppConfig, PollerConfig, StreamConfig, UserInfoConfig};
pub use db::{
    DbConfig, NotificationStore, PgNotificationStore, PgUserStore, UserInfoRow, UserOverrides,
    UserStore, UserTables,
};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use poller::{request_poll, BatchReport, DiffEngine, PendingPolls, Poller};
pub use state::{AppState, BackgroundTasks};
pub use stream::{
    channel_transport, NotificationStreamer, RequestContext, SessionEnd, StreamSink, StreamSource,
};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use userinfo::{SuperuserPolicy, UserInfoRetriever};
