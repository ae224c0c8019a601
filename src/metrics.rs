use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_latency(name: &'static str, latency: Duration) {
    ::metrics::histogram!(name, latency.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
fn metric_latency(_name: &'static str, _latency: Duration) {}

/// Receiver of pipeline observations.
///
/// Injected into the gateway and the consumer; implementations must be
/// callable concurrently from request handlers.
pub trait MetricsSink: Send + Sync {
    fn record_received(&self, at: DateTime<Utc>, latency: Duration);
    fn record_processed(&self, latency: Duration);
    fn record_retried(&self);
    fn record_failed(&self);
    fn snapshot(&self) -> MetricsSnapshot;
}

/// Counters as reported on the health and metrics endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub webhooks_received: u64,
    pub webhooks_processed: u64,
    pub webhooks_failed: u64,
    pub webhooks_retried: u64,
    pub average_latency_ms: u64,
    pub last_webhook_time: Option<DateTime<Utc>>,
}

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    /// Milliseconds since the epoch; zero until the first webhook.
    last_received_ms: AtomicI64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_latency(&self, latency: Duration) {
        self.latency_total_ms.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricsSink for RelayMetrics {
    fn record_received(&self, at: DateTime<Utc>, latency: Duration) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.last_received_ms.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
        self.record_latency(latency);
        metric_inc("relay.webhooks.received");
        metric_latency("relay.ingest.latency", latency);
    }

    fn record_processed(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
        metric_inc("relay.webhooks.processed");
        metric_latency("relay.forward.latency", latency);
    }

    fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        metric_inc("relay.webhooks.retried");
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metric_inc("relay.webhooks.failed");
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);
        let last = self.last_received_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            webhooks_received: self.received.load(Ordering::Relaxed),
            webhooks_processed: self.processed.load(Ordering::Relaxed),
            webhooks_failed: self.failed.load(Ordering::Relaxed),
            webhooks_retried: self.retried.load(Ordering::Relaxed),
            average_latency_ms: if samples == 0 { 0 } else { total / samples },
            last_webhook_time: if last == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last).single()
            },
        }
    }
}
