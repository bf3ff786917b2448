//! Dead Letter Queue records and routing.
//!
//! When an event permanently fails validation or exhausts its retry
//! budget, [`DlqRouter`] wraps the original record with failure metadata
//! and publishes it to the DLQ topic for manual investigation and
//! potential replay.
//!
//! The DLQ topic has a single partition so records arrive in failure
//! order, which keeps human triage sequential. A [`DlqRecord`] is never
//! mutated after creation; replaying one publishes a new record to the
//! original topic and leaves the stored record untouched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use crate::broker::{Broker, BrokerError, Delivery, RecordMeta};
use crate::consumer::{ConsumeError, RecoveryStrategy};
use crate::metrics::PipelineMetrics;

/// The DLQ topic always has exactly one partition.
pub const DLQ_PARTITION: u32 = 0;

/// Where a record is in its triage lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    /// Failed permanently without entering the retry loop.
    Failed,
    /// Failed transiently until the retry budget ran out.
    RetryExhausted,
    /// Parked for an operator to look at.
    ManualReview,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Failed => "FAILED",
            ProcessingStatus::RetryExhausted => "RETRY_EXHAUSTED",
            ProcessingStatus::ManualReview => "MANUAL_REVIEW",
        }
    }
}

/// A failed event preserved for analysis and replay.
///
/// Captures everything needed to understand the failure and to republish
/// the original payload: where the record came from, what it contained,
/// and what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    /// Topic the record was consumed from.
    pub original_topic: String,

    /// Partition within the original topic.
    pub original_partition: u32,

    /// Offset within the original partition.
    pub original_offset: i64,

    /// Partitioning key of the original record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_key: Option<String>,

    /// The original payload. Payloads that are not valid JSON are kept as
    /// their lossy string form.
    pub original_value: Value,

    /// Message of the error that exhausted processing.
    pub error_message: String,

    /// Class name of the error, e.g. `ValidationError` or `IndexTimeout`.
    pub error_class: String,

    /// Epoch milliseconds at which the failure was recorded.
    pub failure_timestamp: i64,

    /// Retries performed before giving up. Zero for validation rejects.
    pub retry_count: u32,

    /// Triage lifecycle status.
    pub processing_status: ProcessingStatus,
}

impl DlqRecord {
    /// Build a record from a failed delivery and the error that ended it.
    pub fn from_failure(
        delivery: &Delivery,
        error: &ConsumeError,
        retry_count: u32,
        status: ProcessingStatus,
    ) -> Self {
        let original_value = serde_json::from_slice(&delivery.payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&delivery.payload).into_owned())
        });
        Self {
            original_topic: delivery.topic.clone(),
            original_partition: delivery.partition,
            original_offset: delivery.offset,
            original_key: delivery.key.clone(),
            original_value,
            error_message: error.to_string(),
            error_class: error.class_name().to_string(),
            failure_timestamp: Utc::now().timestamp_millis(),
            retry_count,
            processing_status: status,
        }
    }

    /// One-line summary for logs and alerts.
    pub fn summary(&self) -> String {
        format!(
            "dlq[{}:{}:{}] {}: {}",
            self.original_topic,
            self.original_partition,
            self.original_offset,
            self.error_class,
            self.error_message
        )
    }

    /// Failure time as a timestamp, when the epoch value is representable.
    pub fn failure_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.failure_timestamp).single()
    }
}

/// Routes failed deliveries to the DLQ topic.
///
/// The publish is best-effort: if the DLQ topic itself is unreachable the
/// failure is logged and counted, and the record is lost. There is nothing
/// further downstream to fall back to.
pub struct DlqRouter {
    broker: Arc<dyn Broker>,
    dlq_topic: String,
    metrics: Arc<PipelineMetrics>,
}

impl DlqRouter {
    pub fn new(
        broker: Arc<dyn Broker>,
        dlq_topic: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            dlq_topic: dlq_topic.into(),
            metrics,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for DlqRouter {
    async fn recover(
        &self,
        delivery: &Delivery,
        error: &ConsumeError,
        retry_count: u32,
        status: ProcessingStatus,
    ) {
        let record = DlqRecord::from_failure(delivery, error, retry_count, status);
        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, summary = %record.summary(), "could not serialize DLQ record");
                self.metrics.record_dlq_publish_failure();
                return;
            }
        };

        match self
            .broker
            .publish(&self.dlq_topic, delivery.key.as_deref(), &payload)
            .await
        {
            Ok(meta) => {
                self.metrics.record_dlq_routed();
                info!(
                    dlq_offset = meta.offset,
                    retry_count,
                    status = status.as_str(),
                    summary = %record.summary(),
                    "routed failed event to DLQ"
                );
            }
            Err(e) => {
                self.metrics.record_dlq_publish_failure();
                error!(
                    error = %e,
                    summary = %record.summary(),
                    "DLQ publish failed, record dropped"
                );
            }
        }
    }
}

/// Errors from a manual replay request.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("could not serialize replay payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not republish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Republish a stored record's original payload to its original topic.
///
/// The payload goes out exactly as captured, under the original key, so a
/// replayed event re-enters the pipeline like any other. The stored
/// [`DlqRecord`] is not deleted or modified; replay is purely additive.
pub async fn replay(broker: &dyn Broker, record: &DlqRecord) -> Result<RecordMeta, ReplayError> {
    let payload = match &record.original_value {
        // Non-JSON payloads were preserved as their raw string form.
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other)?,
    };
    broker
        .publish(&record.original_topic, record.original_key.as_deref(), &payload)
        .await
        .map_err(|e| ReplayError::Publish {
            topic: record.original_topic.clone(),
            source: e,
        })
}
