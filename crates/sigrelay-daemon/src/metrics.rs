//! Prometheus metrics for the replication plane.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sigrelay_ingest_latency_seconds` | Histogram | - |
//! | `sigrelay_signals_accepted_total` | Counter | - |
//! | `sigrelay_rejections_total` | Counter | `reason` |
//! | `sigrelay_connections_active` | Gauge | `kind` |
//! | `sigrelay_pushes_total` | Counter | - |
//! | `sigrelay_acks_total` | Counter | - |
//! | `sigrelay_trust_pauses_total` | Counter | - |
//! | `sigrelay_log_append_errors_total` | Counter | - |
//!
//! The ingest latency histogram buckets bracket the sub-20 ms p99
//! target so the alerting threshold falls on a bucket boundary.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for ingest latency, in seconds.
pub const INGEST_LATENCY_BUCKETS: &[f64] = &[0.001, 0.0025, 0.005, 0.01, 0.02, 0.05, 0.1];

/// Errors during metrics setup or export.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Daemon metrics handle. `Clone`, `Send`, and `Sync`; all metrics use
/// interior mutability.
#[derive(Clone)]
pub struct DaemonMetrics {
    ingest_latency: Histogram,
    signals_accepted: IntCounter,
    rejections: CounterVec,
    connections_active: GaugeVec,
    pushes: IntCounter,
    acks: IntCounter,
    trust_pauses: IntCounter,
    log_append_errors: IntCounter,
}

impl DaemonMetrics {
    /// Create and register all metric families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] on duplicate
    /// registration.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let ingest_latency = Histogram::with_opts(
            HistogramOpts::new(
                "sigrelay_ingest_latency_seconds",
                "Socket-read to log-commit latency per accepted signal",
            )
            .buckets(INGEST_LATENCY_BUCKETS.to_vec()),
        )?;
        let signals_accepted = IntCounter::new(
            "sigrelay_signals_accepted_total",
            "Signals committed to the log",
        )?;
        let rejections = CounterVec::new(
            Opts::new("sigrelay_rejections_total", "Rejections by reason"),
            &["reason"],
        )?;
        let connections_active = GaugeVec::new(
            Opts::new(
                "sigrelay_connections_active",
                "Open connections by peer kind",
            ),
            &["kind"],
        )?;
        let pushes = IntCounter::new("sigrelay_pushes_total", "Signals pushed to receivers")?;
        let acks = IntCounter::new("sigrelay_acks_total", "Positive receiver acks")?;
        let trust_pauses = IntCounter::new(
            "sigrelay_trust_pauses_total",
            "Auto-pause transitions by the trust loop",
        )?;
        let log_append_errors = IntCounter::new(
            "sigrelay_log_append_errors_total",
            "Failed signal log appends",
        )?;

        registry.register(Box::new(ingest_latency.clone()))?;
        registry.register(Box::new(signals_accepted.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(pushes.clone()))?;
        registry.register(Box::new(acks.clone()))?;
        registry.register(Box::new(trust_pauses.clone()))?;
        registry.register(Box::new(log_append_errors.clone()))?;

        Ok(Self {
            ingest_latency,
            signals_accepted,
            rejections,
            connections_active,
            pushes,
            acks,
            trust_pauses,
            log_append_errors,
        })
    }

    /// Record an accepted signal and its socket-to-commit latency.
    pub fn signal_accepted(&self, latency_seconds: f64) {
        self.signals_accepted.inc();
        self.ingest_latency.observe(latency_seconds);
    }

    /// Record a rejection by stable reason string.
    pub fn rejection(&self, reason: &str) {
        self.rejections.with_label_values(&[reason]).inc();
    }

    /// A connection of `kind` (`producer` / `receiver`) opened.
    pub fn connection_opened(&self, kind: &str) {
        self.connections_active.with_label_values(&[kind]).inc();
    }

    /// A connection of `kind` closed.
    pub fn connection_closed(&self, kind: &str) {
        self.connections_active.with_label_values(&[kind]).dec();
    }

    /// A signal was pushed to a receiver.
    pub fn push_delivered(&self) {
        self.pushes.inc();
    }

    /// A positive receiver ack arrived.
    pub fn ack_received(&self) {
        self.acks.inc();
    }

    /// The trust loop paused a subscription.
    pub fn trust_pause(&self) {
        self.trust_pauses.inc();
    }

    /// A log append failed.
    pub fn log_append_error(&self) {
        self.log_append_errors.inc();
    }
}

/// Shared registry plus the daemon metrics registered in it.
pub struct MetricsRegistry {
    registry: Registry,
    daemon: DaemonMetrics,
}

/// Shared handle used across tasks.
pub type SharedMetrics = Arc<MetricsRegistry>;

impl MetricsRegistry {
    /// Fresh registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let daemon = DaemonMetrics::new(&registry)?;
        Ok(Self { registry, daemon })
    }

    /// The daemon metrics handle.
    #[must_use]
    pub fn daemon(&self) -> &DaemonMetrics {
        &self.daemon
    }

    /// Encode every registered family in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Build the axum router serving `/metrics`.
pub fn metrics_router(shared: SharedMetrics) -> axum::Router {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;

    async fn handler(State(shared): State<SharedMetrics>) -> Result<String, StatusCode> {
        shared
            .encode_text()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    axum::Router::new()
        .route("/metrics", get(handler))
        .with_state(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_encodes() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon();
        metrics.signal_accepted(0.004);
        metrics.rejection("TTL_EXPIRED");
        metrics.rejection("TTL_EXPIRED");
        metrics.connection_opened("producer");
        metrics.push_delivered();
        metrics.ack_received();
        metrics.trust_pause();

        let text = registry.encode_text().unwrap();
        assert!(text.contains("sigrelay_signals_accepted_total 1"));
        assert!(text.contains("sigrelay_rejections_total{reason=\"TTL_EXPIRED\"} 2"));
        assert!(text.contains("sigrelay_connections_active{kind=\"producer\"} 1"));
        assert!(text.contains("sigrelay_trust_pauses_total 1"));
    }

    #[test]
    fn gauge_tracks_open_and_close() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon();
        metrics.connection_opened("receiver");
        metrics.connection_opened("receiver");
        metrics.connection_closed("receiver");
        let text = registry.encode_text().unwrap();
        assert!(text.contains("sigrelay_connections_active{kind=\"receiver\"} 1"));
    }
}
