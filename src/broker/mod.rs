//! The partitioned log the pipeline runs on.
//!
//! A topic is an ordered, partitioned, append-only log. Ordering is
//! guaranteed only within a partition, so records carrying a key are routed
//! by key hash and records for one key always land on the same partition.
//! Consumer groups track a commit cursor per partition; a record is
//! redelivered until it is committed, which is what makes delivery
//! at-least-once.
//!
//! The pipeline talks to the log only through the [`Broker`] trait. Two
//! implementations exist: [`redis::RedisBroker`] over Redis Streams for
//! production, and [`memory::MemoryBroker`] for development and tests.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

/// Errors surfaced by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("topic '{topic}' has no partition {partition}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("consumer group '{0}' does not exist")]
    UnknownGroup(String),

    #[error("unsupported broker url '{0}'")]
    UnsupportedUrl(String),
}

/// Where a published record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub partition: u32,
    pub offset: i64,
}

/// A record pulled from a topic, awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Log-end offsets of one partition.
///
/// `low` is the first retained offset, `high` the next offset to be
/// assigned; `high - low` is the record count as the log sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

impl Watermarks {
    pub fn count(&self) -> i64 {
        (self.high - self.low).max(0)
    }
}

/// Narrow interface to the partitioned log.
///
/// `fetch` is a short poll: it returns `Ok(None)` when nothing is
/// available so callers can interleave shutdown checks. An uncommitted
/// fetch is redelivered on the next call for the same group and partition.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the topic with the given partition count if it does not exist.
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<(), BrokerError>;

    /// Create a consumer group on the topic if it does not exist. New groups
    /// start from the beginning of the log.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BrokerError>;

    /// Partition count of the topic.
    async fn partitions(&self, topic: &str) -> Result<u32, BrokerError>;

    /// Append a record, routed by key hash. Keyless records land on
    /// partition 0.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<RecordMeta, BrokerError>;

    /// Pull the next unacknowledged record for a group from one partition.
    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a record, advancing the group's cursor past it.
    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError>;

    /// Log-end offsets of one partition.
    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks, BrokerError>;

    /// Read up to `limit` retained records starting at `from_offset`
    /// (inclusive), independent of any consumer group.
    async fn scan(
        &self,
        topic: &str,
        partition: u32,
        from_offset: i64,
        limit: usize,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Remove a single record. Returns whether it existed. Watermarks are
    /// unaffected; the log ends stay where they are.
    async fn remove(&self, topic: &str, partition: u32, offset: i64) -> Result<bool, BrokerError>;
}

/// Route a key to a partition with a stable FNV-1a hash.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    if partitions <= 1 {
        return 0;
    }
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(partitions)) as u32
}

/// Total retained record count of a topic, summed over its partitions from
/// the broker's own watermarks.
pub async fn topic_record_count(broker: &dyn Broker, topic: &str) -> Result<i64, BrokerError> {
    let partitions = broker.partitions(topic).await?;
    let mut total = 0;
    for partition in 0..partitions {
        total += broker.watermarks(topic, partition).await?.count();
    }
    Ok(total)
}

/// Connect to the broker named by a URL.
///
/// `redis://` (or `rediss://`) connects a [`RedisBroker`]; `memory://`
/// creates a process-local [`MemoryBroker`], useful for development.
pub async fn connect(url: &str, consumer_name: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(Arc::new(RedisBroker::connect(url, consumer_name)?))
    } else if url.starts_with("memory://") {
        Ok(Arc::new(MemoryBroker::new()))
    } else {
        Err(BrokerError::UnsupportedUrl(url.to_string()))
    }
}
