//! Notification Stream Multiplexer
//!
//! Long-lived per-client sessions that merge user, job, grade, system and
//! mailbox notifications plus user info changes into one outbound stream.

pub mod counter;
pub mod interest;
pub mod loops;
pub mod session;
pub mod transport;

pub use counter::UnreadCounter;
pub use interest::InterestSet;
pub use loops::{envelope_for, judge, Verdict};
pub use session::{NotificationStreamer, SessionEnd};
pub use transport::{
    channel_transport, ChannelSink, ChannelSource, ClientHandle, RequestContext, StreamSink,
    StreamSource,
};
