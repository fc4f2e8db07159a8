//! VIGIL Telemetry - Observability Infrastructure
//!
//! Structured logging through `tracing-subscriber` and Prometheus metrics
//! for the poller, the retriever and stream sessions. Both work standalone
//! without an external collector.

pub mod metrics;
pub mod tracer;

pub use metrics::{gather, VigilMetrics, METRICS};
pub use tracer::{init_tracing, LogFormat, TelemetryConfig};
