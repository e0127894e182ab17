//! Prometheus Metrics Definitions
//!
//! Cache degradations and live transport errors are never surfaced to
//! callers, so these counters (and the logs) are the only place they show up.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, CounterVec, Encoder, Gauge,
    IntCounter, TextEncoder,
};

use crate::error::{ConfigError, TabulaResult};

/// Global metrics instance - initialized once on first use
pub static METRICS: Lazy<TabulaResult<TabulaMetrics>> = Lazy::new(TabulaMetrics::new);

/// Outcome label of a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Cache skipped because the call runs inside a write transaction.
    Bypass,
    /// Cache provider failed; the read went to the store.
    Degraded,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Bypass => "bypass",
            Self::Degraded => "degraded",
        }
    }
}

/// Container for all tabula metrics.
#[derive(Clone)]
pub struct TabulaMetrics {
    /// Cache reads - labels: entity, read_kind, outcome
    pub cache_reads_total: CounterVec,

    /// Cache invalidations - labels: entity, status
    pub cache_invalidations_total: CounterVec,

    /// Current live record subscriptions
    pub live_subscriptions: Gauge,

    /// Events delivered to listeners - labels: kind
    pub live_events_delivered_total: CounterVec,

    /// Transport errors observed on live subscriptions
    pub live_transport_errors_total: IntCounter,
}

fn registration_error(metric: &str, e: prometheus::Error) -> ConfigError {
    ConfigError::MetricsRegistration {
        metric: metric.to_string(),
        reason: e.to_string(),
    }
}

impl TabulaMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> TabulaResult<Self> {
        Ok(Self {
            cache_reads_total: register_counter_vec!(
                "tabula_cache_reads_total",
                "Total cache-aside reads by outcome",
                &["entity", "read_kind", "outcome"]
            )
            .map_err(|e| registration_error("tabula_cache_reads_total", e))?,

            cache_invalidations_total: register_counter_vec!(
                "tabula_cache_invalidations_total",
                "Total cache invalidation calls",
                &["entity", "status"]
            )
            .map_err(|e| registration_error("tabula_cache_invalidations_total", e))?,

            live_subscriptions: register_gauge!(
                "tabula_live_subscriptions",
                "Current number of live record subscriptions"
            )
            .map_err(|e| registration_error("tabula_live_subscriptions", e))?,

            live_events_delivered_total: register_counter_vec!(
                "tabula_live_events_delivered_total",
                "Total record events delivered to listeners",
                &["kind"]
            )
            .map_err(|e| registration_error("tabula_live_events_delivered_total", e))?,

            live_transport_errors_total: register_int_counter!(
                "tabula_live_transport_errors_total",
                "Total transport errors observed on live subscriptions"
            )
            .map_err(|e| registration_error("tabula_live_transport_errors_total", e))?,
        })
    }

    /// Record a cache read.
    pub fn record_cache_read(&self, entity: &str, read_kind: &str, outcome: CacheOutcome) {
        self.cache_reads_total
            .with_label_values(&[entity, read_kind, outcome.as_str()])
            .inc();
    }

    /// Record an invalidation call.
    pub fn record_invalidation(&self, entity: &str, ok: bool) {
        let status = if ok { "ok" } else { "failed" };
        self.cache_invalidations_total
            .with_label_values(&[entity, status])
            .inc();
    }

    /// Record a delivered listener event.
    pub fn record_event_delivered(&self, kind: &str) {
        self.live_events_delivered_total
            .with_label_values(&[kind])
            .inc();
    }
}

/// The global metrics, if registration succeeded.
pub fn metrics() -> Option<&'static TabulaMetrics> {
    METRICS.as_ref().ok()
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> TabulaResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| registration_error("encode", e))?;
    String::from_utf8(buffer).map_err(|e| {
        ConfigError::MetricsRegistration {
            metric: "encode".to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let first = metrics().expect("metrics registered");
        first.record_cache_read("record", "point", CacheOutcome::Hit);
        first.record_invalidation("record", true);
        first.live_transport_errors_total.inc();

        // A second lookup reuses the same instance instead of re-registering.
        let second = metrics().expect("metrics registered");
        assert!(second.live_transport_errors_total.get() >= 1);
    }

    #[test]
    fn test_gather_contains_cache_reads() {
        if let Some(m) = metrics() {
            m.record_cache_read("field", "collection", CacheOutcome::Miss);
        }
        let text = gather_metrics().unwrap();
        assert!(text.contains("tabula_cache_reads_total"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Bypass.as_str(), "bypass");
        assert_eq!(CacheOutcome::Degraded.as_str(), "degraded");
    }
}
