//! The search-index collaborator contract.
//!
//! The consumer talks to the search index only through [`SearchIndex`].
//! Because delivery is at-least-once, both operations must be idempotent:
//! redelivering a `sync` re-upserts the same document and redelivering a
//! `delete` is a no-op on an already-absent document.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Reserved entity id that [`LoggingIndex`] fails with a timeout.
///
/// The operator error-injection endpoint publishes a well-formed event for
/// this id to exercise the transient-failure and retry path end to end.
pub const PROBE_ENTITY_ID: i64 = 999_999_999;

/// Errors surfaced by a search-index implementation.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index request timed out: {0}")]
    Timeout(String),

    #[error("index connection failed: {0}")]
    Connection(String),

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("index rejected entity {entity_id}: {reason}")]
    Rejected { entity_id: i64, reason: String },

    #[error("index error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Whether retrying can never succeed. Anything not known to be
    /// permanent is treated as transient.
    pub fn is_permanent(&self) -> bool {
        matches!(self, IndexError::Rejected { .. })
    }

    /// Error class name recorded in dead-letter records.
    pub fn class_name(&self) -> &'static str {
        match self {
            IndexError::Timeout(_) => "IndexTimeout",
            IndexError::Connection(_) => "IndexConnection",
            IndexError::Unavailable(_) => "IndexUnavailable",
            IndexError::Rejected { .. } => "IndexRejected",
            IndexError::Internal(_) => "IndexInternal",
        }
    }
}

/// Interface the consumer uses to propagate catalog changes.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Implementation name, for logs.
    fn name(&self) -> &str;

    /// Upsert the entity's document into the index.
    async fn sync_entity(&self, entity_id: i64) -> Result<(), IndexError>;

    /// Remove the entity's document from the index.
    async fn delete_entity(&self, entity_id: i64) -> Result<(), IndexError>;
}

/// Standalone implementation that only logs.
///
/// Used in development setups without a real index behind the pipeline.
/// Requests for [`PROBE_ENTITY_ID`] fail with a timeout so the retry and
/// dead-letter paths can be exercised on demand.
#[derive(Debug, Clone, Default)]
pub struct LoggingIndex;

impl LoggingIndex {
    pub fn new() -> Self {
        Self
    }

    fn probe_check(&self, entity_id: i64) -> Result<(), IndexError> {
        if entity_id == PROBE_ENTITY_ID {
            return Err(IndexError::Timeout(format!(
                "probe entity {} always times out",
                entity_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for LoggingIndex {
    fn name(&self) -> &str {
        "logging-index"
    }

    async fn sync_entity(&self, entity_id: i64) -> Result<(), IndexError> {
        self.probe_check(entity_id)?;
        info!(entity_id, "synced entity to index");
        Ok(())
    }

    async fn delete_entity(&self, entity_id: i64) -> Result<(), IndexError> {
        self.probe_check(entity_id)?;
        info!(entity_id, "deleted entity from index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rejections_are_permanent() {
        assert!(!IndexError::Timeout("t".into()).is_permanent());
        assert!(!IndexError::Connection("c".into()).is_permanent());
        assert!(!IndexError::Unavailable("u".into()).is_permanent());
        assert!(!IndexError::Internal("i".into()).is_permanent());
        assert!(IndexError::Rejected {
            entity_id: 1,
            reason: "mapping conflict".into()
        }
        .is_permanent());
    }

    #[tokio::test]
    async fn test_logging_index_succeeds() {
        let index = LoggingIndex::new();
        assert!(index.sync_entity(42).await.is_ok());
        assert!(index.delete_entity(42).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_entity_times_out() {
        let index = LoggingIndex::new();
        let err = index.sync_entity(PROBE_ENTITY_ID).await.unwrap_err();
        assert!(matches!(err, IndexError::Timeout(_)));
        assert!(!err.is_permanent());
    }
}
