//! Event publication for the write path.
//!
//! [`EventProducer`] is the only thing write-path code needs to hold: after
//! a catalog mutation commits, it publishes the matching sync or delete
//! event. Events are keyed by entity id so everything about one entity
//! stays on one partition, in order.
//!
//! Index propagation is deliberately decoupled from the caller's
//! transaction. A publish failure must never roll the mutation back;
//! write-path callers use [`EventProducer::publish_logged`], which logs the
//! failure and moves on.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::broker::{Broker, BrokerError, RecordMeta};
use crate::event::{SyncAction, SyncEvent};
use crate::metrics::PipelineMetrics;

/// Errors from publishing a sync event.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("could not serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not append to '{topic}': {source}")]
    Broker {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Publishes sync events to the primary topic.
#[derive(Clone)]
pub struct EventProducer {
    broker: Arc<dyn Broker>,
    topic: String,
    metrics: Arc<PipelineMetrics>,
}

impl EventProducer {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a sync event keyed by entity id.
    pub async fn publish(
        &self,
        entity_id: i64,
        action: SyncAction,
    ) -> Result<RecordMeta, PublishError> {
        let event = SyncEvent::new(entity_id, action);
        let payload = serde_json::to_vec(&event)?;
        let meta = self
            .broker
            .publish(&self.topic, Some(&event.key()), &payload)
            .await
            .map_err(|e| {
                self.metrics.record_publish_failure();
                PublishError::Broker {
                    topic: self.topic.clone(),
                    source: e,
                }
            })?;

        self.metrics.record_published();
        info!(
            entity_id,
            action = action.as_str(),
            partition = meta.partition,
            offset = meta.offset,
            "sync event published"
        );
        Ok(meta)
    }

    /// Fire-and-forget publish for write-path callers.
    ///
    /// A failure here is logged and swallowed: the caller's own transaction
    /// has already committed and must not be affected. The index catches up
    /// when the entity changes next, or via manual replay.
    pub async fn publish_logged(&self, entity_id: i64, action: SyncAction) {
        if let Err(e) = self.publish(entity_id, action).await {
            error!(
                entity_id,
                action = action.as_str(),
                error = %e,
                "sync event publish failed; continuing without index propagation"
            );
        }
    }

    /// Append a payload to the primary topic exactly as given.
    ///
    /// Used by the operator surface to inject test payloads, including ones
    /// that are intentionally invalid.
    pub async fn publish_raw(
        &self,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<RecordMeta, PublishError> {
        let meta = self
            .broker
            .publish(&self.topic, key, payload)
            .await
            .map_err(|e| {
                self.metrics.record_publish_failure();
                PublishError::Broker {
                    topic: self.topic.clone(),
                    source: e,
                }
            })?;
        self.metrics.record_published();
        Ok(meta)
    }
}
