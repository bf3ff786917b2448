//! Core event types for the catalog sync pipeline.
//!
//! A [`SyncEvent`] is emitted by the write path after a catalog mutation
//! commits, and tells the index workers what to do with the entity. Events
//! are appended to the primary topic keyed by entity id, so all events for
//! one entity land on the same partition and stay ordered.
//!
//! Decoding is strict: payloads are accepted through [`SyncEvent::from_payload`],
//! which turns anything malformed into a [`ValidationError`]. Validation
//! failures are permanent and are never retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What an index worker should do with an entity.
///
/// The wire form is the lowercase variant name (`"sync"` / `"delete"`).
/// Unknown strings never coerce to a variant; they are rejected at the
/// trust boundary as [`ValidationError::UnknownAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Upsert the entity's document into the search index.
    Sync,
    /// Remove the entity's document from the search index.
    Delete,
}

impl SyncAction {
    /// Parse a wire-form action string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(SyncAction::Sync),
            "delete" => Some(SyncAction::Delete),
            _ => None,
        }
    }

    /// The wire-form name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Sync => "sync",
            SyncAction::Delete => "delete",
        }
    }
}

/// An index synchronization command flowing through the primary topic.
///
/// # Wire format
///
/// ```json
/// { "entityId": 42, "action": "sync" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Catalog entity the command applies to. Always positive.
    #[serde(rename = "entityId")]
    pub entity_id: i64,

    /// What to do with the entity.
    pub action: SyncAction,
}

impl SyncEvent {
    /// Create a new event.
    pub fn new(entity_id: i64, action: SyncAction) -> Self {
        Self { entity_id, action }
    }

    /// Shorthand for an upsert event.
    pub fn sync(entity_id: i64) -> Self {
        Self::new(entity_id, SyncAction::Sync)
    }

    /// Shorthand for a delete event.
    pub fn delete(entity_id: i64) -> Self {
        Self::new(entity_id, SyncAction::Delete)
    }

    /// Partitioning key: events for one entity must stay ordered.
    pub fn key(&self) -> String {
        self.entity_id.to_string()
    }

    /// Decode and validate a raw payload from the log.
    ///
    /// Goes through a permissive intermediate form so that each way a
    /// payload can be wrong maps to a precise [`ValidationError`] instead
    /// of an opaque deserialization message.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ValidationError> {
        let raw: RawSyncEvent = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let entity_id = raw.entity_id.ok_or(ValidationError::MissingEntityId)?;
        if entity_id <= 0 {
            return Err(ValidationError::InvalidEntityId(entity_id));
        }

        let action = raw.action.ok_or(ValidationError::MissingAction)?;
        let action = SyncAction::parse(&action).ok_or(ValidationError::UnknownAction(action))?;

        Ok(Self { entity_id, action })
    }
}

/// Permissive wire form used only at the trust boundary.
///
/// Both fields tolerate `null` and absence so validation can name what is
/// actually wrong with the payload.
#[derive(Debug, Deserialize)]
struct RawSyncEvent {
    #[serde(rename = "entityId", default)]
    entity_id: Option<i64>,

    #[serde(default)]
    action: Option<String>,
}

/// A payload that can never become a valid [`SyncEvent`].
///
/// Every variant is permanent: the same bytes will fail the same way on
/// every delivery, so these are routed straight to the dead-letter queue
/// without entering the retry loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("event has no entity id")]
    MissingEntityId,

    #[error("entity id must be positive, got {0}")]
    InvalidEntityId(i64),

    #[error("event has no action")]
    MissingAction,

    #[error("unknown action '{0}'")]
    UnknownAction(String),
}

impl ValidationError {
    /// Error class name recorded in dead-letter records.
    pub fn class_name(&self) -> &'static str {
        "ValidationError"
    }
}
