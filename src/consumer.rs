//! The primary consumer group.
//!
//! [`SyncConsumer`] pulls sync events from the primary topic and applies
//! them to the search index. One worker task owns each partition, which is
//! what preserves per-entity ordering without any global lock.
//!
//! Per message the worker runs: validate, then apply to the index with
//! bounded exponential-backoff retry, then commit. The offset is committed
//! only after the index call succeeds, so delivery is at-least-once and a
//! crash between success and commit causes a (harmless, idempotent)
//! redelivery. Failures never escape the loop: every message resolves to
//! either a commit or a hand-off to the injected [`RecoveryStrategy`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::dlq::ProcessingStatus;
use crate::event::{SyncAction, SyncEvent, ValidationError};
use crate::index::{IndexError, SearchIndex};
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;

/// Why processing a delivery failed.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The payload can never become a valid event. Permanent.
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    /// The index collaborator failed.
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl ConsumeError {
    pub fn is_permanent(&self) -> bool {
        match self {
            ConsumeError::Validation(_) => true,
            ConsumeError::Index(e) => e.is_permanent(),
        }
    }

    /// Error class name recorded in dead-letter records.
    pub fn class_name(&self) -> &'static str {
        match self {
            ConsumeError::Validation(e) => e.class_name(),
            ConsumeError::Index(e) => e.class_name(),
        }
    }
}

/// What to do with a delivery the consumer has given up on.
///
/// Injected into the consumer so the recovery path (normally routing to
/// the dead-letter queue) stays swappable and testable.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    async fn recover(
        &self,
        delivery: &Delivery,
        error: &ConsumeError,
        retry_count: u32,
        status: ProcessingStatus,
    );
}

/// Consumer group worker pool for the primary topic.
pub struct SyncConsumer {
    broker: Arc<dyn Broker>,
    topic: String,
    group: String,
    index: Arc<dyn SearchIndex>,
    policy: RetryPolicy,
    recovery: Arc<dyn RecoveryStrategy>,
    metrics: Arc<PipelineMetrics>,
}

impl SyncConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        group: impl Into<String>,
        index: Arc<dyn SearchIndex>,
        policy: RetryPolicy,
        recovery: Arc<dyn RecoveryStrategy>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            group: group.into(),
            index,
            policy,
            recovery,
            metrics,
        }
    }

    /// Spawn one worker task per partition.
    pub fn spawn_workers(
        self: Arc<Self>,
        partitions: u32,
        shutdown: &ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        (0..partitions)
            .map(|partition| {
                let consumer = Arc::clone(&self);
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move { consumer.run_partition(partition, shutdown_rx).await })
            })
            .collect()
    }

    /// Consume one partition until shutdown.
    ///
    /// A shutdown signal is honored between messages: the in-flight message
    /// always finishes its processing and commit before the partition is
    /// released, so a restart redelivers at most the inherent at-least-once
    /// duplicates.
    pub async fn run_partition(&self, partition: u32, mut shutdown: broadcast::Receiver<()>) {
        info!(
            topic = %self.topic,
            group = %self.group,
            partition,
            index = %self.index.name(),
            "partition worker started"
        );

        loop {
            let fetched = tokio::select! {
                _ = shutdown.recv() => {
                    info!(topic = %self.topic, partition, "partition worker shutting down");
                    break;
                }
                fetched = self.broker.fetch(&self.topic, &self.group, partition) => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    self.handle(&delivery).await;
                    if let Err(e) = self
                        .broker
                        .commit(&self.topic, &self.group, partition, delivery.offset)
                        .await
                    {
                        error!(
                            partition,
                            offset = delivery.offset,
                            error = %e,
                            "failed to commit offset; the record will be redelivered"
                        );
                    }
                }
                Ok(None) => {} // idle poll
                Err(e) => {
                    warn!(topic = %self.topic, partition, error = %e, "fetch failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Resolve one delivery to success or a recovery hand-off.
    async fn handle(&self, delivery: &Delivery) {
        let event = match SyncEvent::from_payload(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                // Permanent by definition: the same bytes fail the same way
                // on every delivery, so the retry loop is never entered.
                warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %e,
                    "rejecting event that failed validation"
                );
                self.metrics.record_validation_reject();
                self.recovery
                    .recover(delivery, &ConsumeError::Validation(e), 0, ProcessingStatus::Failed)
                    .await;
                return;
            }
        };

        let started = Instant::now();
        let mut schedule = self.policy.schedule();
        loop {
            match self.apply(&event).await {
                Ok(()) => {
                    self.metrics.record_processed();
                    debug!(
                        entity_id = event.entity_id,
                        action = event.action.as_str(),
                        offset = delivery.offset,
                        "event applied to index"
                    );
                    return;
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        entity_id = event.entity_id,
                        error = %e,
                        "permanent index failure"
                    );
                    self.recovery
                        .recover(
                            delivery,
                            &ConsumeError::Index(e),
                            schedule.attempts(),
                            ProcessingStatus::Failed,
                        )
                        .await;
                    return;
                }
                Err(e) => match schedule.next_delay(started.elapsed()) {
                    Some(delay) => {
                        self.metrics.record_retry();
                        warn!(
                            entity_id = event.entity_id,
                            attempt = schedule.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient index failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.metrics.record_retries_exhausted();
                        error!(
                            entity_id = event.entity_id,
                            retries = schedule.attempts(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "retry budget exhausted"
                        );
                        self.recovery
                            .recover(
                                delivery,
                                &ConsumeError::Index(e),
                                schedule.attempts(),
                                ProcessingStatus::RetryExhausted,
                            )
                            .await;
                        return;
                    }
                },
            }
        }
    }

    async fn apply(&self, event: &SyncEvent) -> Result<(), IndexError> {
        match event.action {
            SyncAction::Sync => self.index.sync_entity(event.entity_id).await,
            SyncAction::Delete => self.index.delete_entity(event.entity_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_permanent() {
        let err = ConsumeError::Validation(ValidationError::MissingEntityId);
        assert!(err.is_permanent());
        assert_eq!(err.class_name(), "ValidationError");
    }

    #[test]
    fn test_transient_index_errors_are_not_permanent() {
        let err = ConsumeError::Index(IndexError::Timeout("slow".into()));
        assert!(!err.is_permanent());
        assert_eq!(err.class_name(), "IndexTimeout");
    }

    #[test]
    fn test_rejected_index_errors_are_permanent() {
        let err = ConsumeError::Index(IndexError::Rejected {
            entity_id: 42,
            reason: "mapping conflict".into(),
        });
        assert!(err.is_permanent());
    }
}
