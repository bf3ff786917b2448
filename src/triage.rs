//! DLQ triage consumer.
//!
//! [`DlqConsumer`] runs as exactly one worker so records are triaged in
//! arrival order. For each record it notifies the configured alert sinks,
//! updates metrics and applies a heuristic classification of whether the
//! failure looks worth replaying.
//!
//! Every record is acknowledged, whether or not triage succeeded. A broken
//! alert sink or an unparseable payload must never stall the DLQ topic;
//! the accepted cost is that a failed triage step can silently lose that
//! one diagnosis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::dlq::{DlqRecord, DLQ_PARTITION};
use crate::event::SyncEvent;
use crate::metrics::PipelineMetrics;
use crate::shutdown::ShutdownSignal;

/// Substrings that mark a failure as probably transient.
const RETRYABLE_HINTS: [&str; 4] = ["timeout", "connection", "network", "unavailable"];

/// Substrings that mark a failure as a system-level emergency.
const CRITICAL_HINTS: [&str; 5] = [
    "out of memory",
    "outofmemory",
    "stack overflow",
    "stackoverflow",
    "no space left",
];

/// Default timeout for alert webhook requests.
const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Does this failure look like it would succeed on replay?
///
/// Case-insensitive substring match over the error message and class, the
/// same terms an operator would grep for.
pub fn is_retryable(record: &DlqRecord) -> bool {
    let message = record.error_message.to_lowercase();
    let class = record.error_class.to_lowercase();
    RETRYABLE_HINTS
        .iter()
        .any(|hint| message.contains(hint) || class.contains(hint))
}

/// Does this failure look like a system-level emergency?
pub fn is_critical(record: &DlqRecord) -> bool {
    let message = record.error_message.to_lowercase();
    let class = record.error_class.to_lowercase();
    CRITICAL_HINTS
        .iter()
        .any(|hint| message.contains(hint) || class.contains(hint))
}

/// Errors from delivering an operator alert.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert endpoint returned status {0}")]
    Status(u16),

    #[error("alert delivery failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Operator notification hook, invoked once per dead-lettered record.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, record: &DlqRecord) -> Result<(), AlertError>;
}

/// Alert sink that writes to the log at error level.
#[derive(Debug, Clone, Default)]
pub struct LogAlert;

impl LogAlert {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AlertSink for LogAlert {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, record: &DlqRecord) -> Result<(), AlertError> {
        error!(
            summary = %record.summary(),
            retry_count = record.retry_count,
            status = record.processing_status.as_str(),
            "operator attention needed: event dead-lettered"
        );
        Ok(())
    }
}

/// Alert sink that POSTs a failure summary to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlert {
    url: String,
    client: Client,
    timeout: Duration,
}

impl WebhookAlert {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_ALERT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AlertSink for WebhookAlert {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, record: &DlqRecord) -> Result<(), AlertError> {
        let body = json!({
            "summary": record.summary(),
            "originalTopic": record.original_topic,
            "errorClass": record.error_class,
            "errorMessage": record.error_message,
            "failureTimestamp": record.failure_timestamp,
            "retryCount": record.retry_count,
            "processingStatus": record.processing_status.as_str(),
            "retryable": is_retryable(record),
            "critical": is_critical(record),
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Single-worker triage consumer for the DLQ topic.
pub struct DlqConsumer {
    broker: Arc<dyn Broker>,
    topic: String,
    group: String,
    alerts: Vec<Arc<dyn AlertSink>>,
    metrics: Arc<PipelineMetrics>,
}

impl DlqConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        group: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            group: group.into(),
            alerts: vec![Arc::new(LogAlert::new())],
            metrics,
        }
    }

    /// Register an additional alert sink.
    pub fn with_alert(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts.push(sink);
        self
    }

    /// Spawn the single triage worker.
    pub fn spawn(self, shutdown: &ShutdownSignal) -> JoinHandle<()> {
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move { self.run(shutdown_rx).await })
    }

    /// Consume the DLQ topic until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(topic = %self.topic, group = %self.group, "DLQ triage worker started");

        loop {
            let fetched = tokio::select! {
                _ = shutdown.recv() => {
                    info!(topic = %self.topic, "DLQ triage worker shutting down");
                    break;
                }
                fetched = self.broker.fetch(&self.topic, &self.group, DLQ_PARTITION) => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    self.triage(&delivery).await;
                    // Acknowledge unconditionally: triage must never stall
                    // the queue.
                    if let Err(e) = self
                        .broker
                        .commit(&self.topic, &self.group, DLQ_PARTITION, delivery.offset)
                        .await
                    {
                        error!(offset = delivery.offset, error = %e, "failed to commit DLQ offset");
                    }
                }
                Ok(None) => {} // idle poll
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "DLQ fetch failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run the triage steps for one record. Never fails.
    async fn triage(&self, delivery: &Delivery) {
        let record: DlqRecord = match serde_json::from_slice(&delivery.payload) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    offset = delivery.offset,
                    error = %e,
                    "unparseable DLQ payload, acknowledging anyway"
                );
                return;
            }
        };

        info!(
            offset = delivery.offset,
            summary = %record.summary(),
            original = %record.original_value,
            "triaging dead-lettered event"
        );

        for sink in &self.alerts {
            if let Err(e) = sink.notify(&record).await {
                error!(sink = sink.name(), error = %e, "alert hook failed");
            }
        }

        self.metrics.record_dlq_triaged();
        self.analyze(&record);
    }

    /// Heuristic classification, logged for the operator.
    fn analyze(&self, record: &DlqRecord) {
        if is_critical(record) {
            self.metrics.record_dlq_critical();
            error!(summary = %record.summary(), "critical failure class in DLQ");
        }
        if is_retryable(record) {
            self.metrics.record_dlq_retryable();
            warn!(
                summary = %record.summary(),
                "failure looks transient; candidate for manual replay"
            );
        }

        // Say what is wrong with the original event when it no longer
        // decodes, the first question an operator asks.
        if let Ok(payload) = serde_json::to_vec(&record.original_value) {
            if let Err(e) = SyncEvent::from_payload(&payload) {
                warn!(
                    original = %record.original_value,
                    error = %e,
                    "original event does not decode"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumeError;
    use crate::dlq::ProcessingStatus;
    use crate::event::ValidationError;
    use crate::index::IndexError;

    fn record_for(error: &ConsumeError) -> DlqRecord {
        let delivery = Delivery {
            topic: "catalog:sync".to_string(),
            partition: 0,
            offset: 1,
            key: None,
            payload: br#"{"entityId":42,"action":"sync"}"#.to_vec(),
        };
        DlqRecord::from_failure(&delivery, error, 0, ProcessingStatus::Failed)
    }

    #[test]
    fn test_timeout_is_retryable() {
        let record = record_for(&ConsumeError::Index(IndexError::Timeout(
            "search cluster timed out".into(),
        )));
        assert!(is_retryable(&record));
        assert!(!is_critical(&record));
    }

    #[test]
    fn test_message_hints_are_matched() {
        for message in [
            "connection refused",
            "Network partition",
            "backend UNAVAILABLE right now",
        ] {
            let record = record_for(&ConsumeError::Index(IndexError::Internal(message.into())));
            assert!(is_retryable(&record), "{message}");
        }
    }

    #[test]
    fn test_validation_reject_is_not_retryable() {
        let record = record_for(&ConsumeError::Validation(ValidationError::MissingEntityId));
        assert!(!is_retryable(&record));
    }

    #[test]
    fn test_critical_classification() {
        let record = record_for(&ConsumeError::Index(IndexError::Internal(
            "worker died: Out of memory".into(),
        )));
        assert!(is_critical(&record));

        let record = record_for(&ConsumeError::Index(IndexError::Internal(
            "no space left on device".into(),
        )));
        assert!(is_critical(&record));
    }

    #[tokio::test]
    async fn test_log_alert_never_fails() {
        let record = record_for(&ConsumeError::Validation(ValidationError::MissingAction));
        assert!(LogAlert::new().notify(&record).await.is_ok());
    }
}
