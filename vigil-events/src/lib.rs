//! VIGIL Events - Bus and Key/Value Contracts
//!
//! This crate defines the collaborator traits the poller, the retriever and
//! the stream multiplexer talk to, plus in-process implementations.
//!
//! # Traits
//!
//! - `EventBus`: publish to a subject, create or delete durable pull consumers
//! - `PullConsumer`: batched fetch with a bounded wait
//! - `KeyValueStore`: create-if-absent with TTL (dedup markers), expiry sweep
//!
//! # Subjects
//!
//! Subjects are dot-separated tokens. Consumer filters accept `*` for one
//! token and `>` for the remaining tokens, see [`subject_matches`].

mod bus;
mod memory;
mod subject;

pub use bus::{
    Acknowledger, BusMessage, BusResult, ConsumerConfig, DeliverPolicy, EventBus, KeyValueStore,
    PullConsumer,
};
pub use memory::{
    InMemoryBusConfig, InMemoryBusStats, InMemoryEventBus, InMemoryKeyValue,
    InMemoryPullConsumer, DEFAULT_CONSUMER_BUFFER, DEFAULT_HISTORY_LIMIT,
};
pub use subject::{any_matches, is_valid_subject, subject_matches};
