//! # Syncopate
//!
//! Keeps the catalog's search index in step with the primary store.
//!
//! Write-path code publishes a sync event after its own transaction
//! commits; partition workers consume the events, call the search index,
//! and commit offsets only on success. Failures are retried with bounded
//! exponential backoff, and anything that permanently fails lands in a
//! dead-letter queue with enough metadata for an operator to diagnose and
//! replay it.
//!
//! ## Architecture
//!
//! ```text
//! Write path -> EventProducer -> primary topic (keyed by entity id)
//!     -> SyncConsumer (one worker per partition) -> SearchIndex
//!         -> commit, or retry with backoff, or DlqRouter -> DLQ topic
//!             -> DlqConsumer (single worker) -> alerts + classification
//!
//! Operator API (axum): status, config, test injection, DLQ listing/replay
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the sync event model and trust-boundary validation
//! - [`broker`]: the partitioned log abstraction and its implementations
//! - [`producer`]: write-path event publication
//! - [`consumer`]: the primary consumer group
//! - [`retry`]: bounded exponential backoff
//! - [`index`]: the search-index collaborator contract
//! - [`dlq`]: dead-letter records, routing and replay
//! - [`triage`]: the DLQ triage consumer and alert sinks
//! - [`api`]: the operator HTTP surface

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod index;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod shutdown;
pub mod triage;

// Re-export the types most callers need at crate root.
pub use broker::{Broker, Delivery, MemoryBroker, RecordMeta, RedisBroker};
pub use consumer::{ConsumeError, RecoveryStrategy, SyncConsumer};
pub use dlq::{DlqRecord, DlqRouter, ProcessingStatus};
pub use event::{SyncAction, SyncEvent, ValidationError};
pub use index::{IndexError, LoggingIndex, SearchIndex};
pub use metrics::PipelineMetrics;
pub use producer::EventProducer;
pub use retry::RetryPolicy;
pub use shutdown::ShutdownSignal;
pub use triage::DlqConsumer;

/// Default primary topic name.
pub const DEFAULT_PRIMARY_TOPIC: &str = "catalog:sync";

/// Default dead-letter topic name.
pub const DEFAULT_DLQ_TOPIC: &str = "catalog:sync:dlq";

/// Default consumer group for the primary topic.
pub const DEFAULT_CONSUMER_GROUP: &str = "catalog_sync_workers";

/// Default consumer group for the DLQ topic.
pub const DEFAULT_DLQ_GROUP: &str = "catalog_dlq_triage";
