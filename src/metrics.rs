//! Pipeline metrics.
//!
//! A [`PipelineMetrics`] registry is created once at startup and injected
//! into every component that records counters. All counters are atomic, so
//! partition workers can update them concurrently without coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};

/// Atomic counter registry shared across the pipeline.
pub struct PipelineMetrics {
    start_time: Instant,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    events_processed: AtomicU64,
    events_retried: AtomicU64,
    validation_rejects: AtomicU64,
    retries_exhausted: AtomicU64,
    dlq_routed: AtomicU64,
    dlq_publish_failures: AtomicU64,
    dlq_triaged: AtomicU64,
    dlq_retryable: AtomicU64,
    dlq_critical: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            events_retried: AtomicU64::new(0),
            validation_rejects: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            dlq_routed: AtomicU64::new(0),
            dlq_publish_failures: AtomicU64::new(0),
            dlq_triaged: AtomicU64::new(0),
            dlq_retryable: AtomicU64::new(0),
            dlq_critical: AtomicU64::new(0),
        }
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.events_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_reject(&self) {
        self.validation_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_routed(&self) {
        self.dlq_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_publish_failure(&self) {
        self.dlq_publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_triaged(&self) {
        self.dlq_triaged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_retryable(&self) {
        self.dlq_retryable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_critical(&self) {
        self.dlq_critical.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dlq_triaged(&self) -> u64 {
        self.dlq_triaged.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn dlq_routed(&self) -> u64 {
        self.dlq_routed.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Snapshot of every counter for the admin surface.
    pub fn snapshot(&self) -> Value {
        json!({
            "eventsPublished": self.events_published.load(Ordering::Relaxed),
            "publishFailures": self.publish_failures.load(Ordering::Relaxed),
            "eventsProcessed": self.events_processed.load(Ordering::Relaxed),
            "eventsRetried": self.events_retried.load(Ordering::Relaxed),
            "validationRejects": self.validation_rejects.load(Ordering::Relaxed),
            "retriesExhausted": self.retries_exhausted.load(Ordering::Relaxed),
            "dlqRouted": self.dlq_routed.load(Ordering::Relaxed),
            "dlqPublishFailures": self.dlq_publish_failures.load(Ordering::Relaxed),
            "dlqTriaged": self.dlq_triaged.load(Ordering::Relaxed),
            "dlqRetryable": self.dlq_retryable.load(Ordering::Relaxed),
            "dlqCritical": self.dlq_critical.load(Ordering::Relaxed),
        })
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_processed();
        metrics.record_processed();
        metrics.record_dlq_routed();

        assert_eq!(metrics.events_processed(), 2);
        assert_eq!(metrics.dlq_routed(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["eventsProcessed"], 2);
        assert_eq!(snapshot["dlqRouted"], 1);
        assert_eq!(snapshot["eventsRetried"], 0);
    }
}
