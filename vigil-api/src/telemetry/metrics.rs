//! Prometheus Metrics Definitions
//!
//! Defines all VIGIL metrics with their labels. [`gather`] renders the
//! default registry in the Prometheus text format for whatever exposes it.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Encoder, Gauge,
    Histogram, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// Batch lookup latency buckets (seconds)
const BATCH_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<ApiResult<VigilMetrics>> = Lazy::new(VigilMetrics::new);

/// Container for all VIGIL metrics.
#[derive(Clone)]
pub struct VigilMetrics {
    /// Poll intake outcomes - labels: outcome (queued/duplicate/malformed/dedup_unavailable)
    pub poll_requests_total: CounterVec,

    /// Batch rows - labels: status (ok/error)
    pub batch_rows_total: CounterVec,

    /// Duration of one batch lookup and diff pass
    pub batch_duration_seconds: Histogram,

    /// Change events - labels: stage (published/applied/forwarded)
    pub change_events_total: CounterVec,

    /// User info cache lookups - labels: result (hit/miss)
    pub cache_lookups_total: CounterVec,

    /// Currently open stream sessions
    pub active_streams: Gauge,

    /// Envelopes written to stream clients - labels: topic
    pub stream_envelopes_total: CounterVec,

    /// Ended stream sessions - labels: reason
    pub stream_sessions_ended_total: CounterVec,
}

impl VigilMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            poll_requests_total: register_counter_vec!(
                "vigil_poll_requests_total",
                "Total poll requests seen by the intake",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register poll_requests_total: {}", e)))?,

            batch_rows_total: register_counter_vec!(
                "vigil_batch_rows_total",
                "Total rows processed by the batch processor",
                &["status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register batch_rows_total: {}", e)))?,

            batch_duration_seconds: register_histogram!(
                "vigil_batch_duration_seconds",
                "Batch lookup and diff duration in seconds",
                BATCH_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register batch_duration_seconds: {}", e)))?,

            change_events_total: register_counter_vec!(
                "vigil_change_events_total",
                "Total user info change events",
                &["stage"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register change_events_total: {}", e)))?,

            cache_lookups_total: register_counter_vec!(
                "vigil_cache_lookups_total",
                "Total user info cache lookups",
                &["result"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register cache_lookups_total: {}", e)))?,

            active_streams: register_gauge!(
                "vigil_active_streams",
                "Current number of open notification streams"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register active_streams: {}", e)))?,

            stream_envelopes_total: register_counter_vec!(
                "vigil_stream_envelopes_total",
                "Total envelopes sent to stream clients",
                &["topic"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register stream_envelopes_total: {}", e)))?,

            stream_sessions_ended_total: register_counter_vec!(
                "vigil_stream_sessions_ended_total",
                "Total ended stream sessions",
                &["reason"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register stream_sessions_ended_total: {}", e)))?,
        })
    }

    pub fn record_poll(&self, outcome: &str) {
        self.poll_requests_total.with_label_values(&[outcome]).inc();
    }

    /// Record one finished batch.
    pub fn record_batch(&self, ok_rows: usize, error_rows: usize, duration_secs: f64) {
        self.batch_rows_total
            .with_label_values(&["ok"])
            .inc_by(ok_rows as f64);
        self.batch_rows_total
            .with_label_values(&["error"])
            .inc_by(error_rows as f64);
        self.batch_duration_seconds.observe(duration_secs);
    }

    pub fn record_change_event(&self, stage: &str) {
        self.change_events_total.with_label_values(&[stage]).inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn stream_opened(&self) {
        self.active_streams.inc();
    }

    pub fn stream_closed(&self, reason: &str) {
        self.active_streams.dec();
        self.stream_sessions_ended_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_envelope(&self, topic: &str) {
        self.stream_envelopes_total.with_label_values(&[topic]).inc();
    }
}

/// Run `f` against the global metrics if they registered successfully.
pub fn with_metrics(f: impl FnOnce(&VigilMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> ApiResult<String> {
    // Force registration so an idle process still reports its series.
    if let Err(e) = METRICS.as_ref() {
        return Err(e.clone());
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::internal_error(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| ApiError::internal_error(format!("Metrics are not valid UTF-8: {}", e)))
}
