//! In-process broker with full partitioned-log semantics.
//!
//! Used by the test suite and by `memory://` development setups where
//! running Redis is not worth the trouble. Offsets are dense and start at
//! zero; removed records leave a hole that scans skip but watermarks keep
//! counting, matching the Redis implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};

use super::{partition_for_key, Broker, BrokerError, Delivery, RecordMeta, Watermarks};

/// How long a fetch waits for new records before returning `None`.
const FETCH_POLL: Duration = Duration::from_millis(250);

struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    removed: bool,
}

struct GroupCursors {
    /// Next offset to hand out, per partition.
    next: Vec<i64>,
    /// Offset fetched but not yet committed, per partition.
    inflight: Vec<Option<i64>>,
}

struct TopicInner {
    partitions: Vec<Vec<StoredRecord>>,
    groups: HashMap<String, GroupCursors>,
}

struct TopicState {
    inner: Mutex<TopicInner>,
    activity: Notify,
}

/// Process-local [`Broker`] implementation.
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn topic(&self, topic: &str) -> Result<Arc<TopicState>, BrokerError> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    /// One non-blocking fetch attempt.
    async fn try_fetch(
        &self,
        state: &TopicState,
        topic: &str,
        group: &str,
        partition: usize,
    ) -> Result<Option<Delivery>, BrokerError> {
        let mut guard = state.inner.lock().await;
        let inner = &mut *guard;
        if partition >= inner.partitions.len() {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition: partition as u32,
            });
        }
        let cursors = inner
            .groups
            .get(group)
            .ok_or_else(|| BrokerError::UnknownGroup(group.to_string()))?;

        // Redeliver the uncommitted record first: the previous fetch may
        // have died before committing.
        let offset = match cursors.inflight[partition] {
            Some(offset) => Some(offset),
            None => {
                let mut cursor = cursors.next[partition];
                let records = &inner.partitions[partition];
                while (cursor as usize) < records.len() && records[cursor as usize].removed {
                    cursor += 1;
                }
                let candidate = ((cursor as usize) < records.len()).then_some(cursor);
                let cursors = inner
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| BrokerError::UnknownGroup(group.to_string()))?;
                // Advance past removed records so they are not revisited.
                cursors.next[partition] = cursor;
                cursors.inflight[partition] = candidate;
                candidate
            }
        };

        Ok(offset.map(|offset| {
            let record = &inner.partitions[partition][offset as usize];
            Delivery {
                topic: topic.to_string(),
                partition: partition as u32,
                offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
            }
        }))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<(), BrokerError> {
        let mut topics = self.topics.write().await;
        topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(TopicState {
                inner: Mutex::new(TopicInner {
                    partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
                    groups: HashMap::new(),
                }),
                activity: Notify::new(),
            })
        });
        Ok(())
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let state = self.topic(topic).await?;
        let mut inner = state.inner.lock().await;
        let partitions = inner.partitions.len();
        inner.groups.entry(group.to_string()).or_insert_with(|| GroupCursors {
            next: vec![0; partitions],
            inflight: vec![None; partitions],
        });
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<u32, BrokerError> {
        let state = self.topic(topic).await?;
        let inner = state.inner.lock().await;
        Ok(inner.partitions.len() as u32)
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<RecordMeta, BrokerError> {
        let state = self.topic(topic).await?;
        let mut inner = state.inner.lock().await;
        let partition = match key {
            Some(key) => partition_for_key(key, inner.partitions.len() as u32),
            None => 0,
        };
        let log = &mut inner.partitions[partition as usize];
        let offset = log.len() as i64;
        log.push(StoredRecord {
            key: key.map(str::to_string),
            payload: payload.to_vec(),
            removed: false,
        });
        drop(inner);
        state.activity.notify_waiters();
        Ok(RecordMeta { partition, offset })
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<Delivery>, BrokerError> {
        let state = self.topic(topic).await?;
        let partition = partition as usize;

        // Arm the wakeup before the first attempt so a publish between the
        // attempt and the wait is not missed.
        let notified = state.activity.notified();
        if let Some(delivery) = self.try_fetch(&state, topic, group, partition).await? {
            return Ok(Some(delivery));
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(FETCH_POLL) => {}
        }
        self.try_fetch(&state, topic, group, partition).await
    }

    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError> {
        let state = self.topic(topic).await?;
        let mut inner = state.inner.lock().await;
        let cursors = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| BrokerError::UnknownGroup(group.to_string()))?;
        let partition = partition as usize;
        if partition >= cursors.next.len() {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition: partition as u32,
            });
        }
        if cursors.inflight[partition] == Some(offset) {
            cursors.inflight[partition] = None;
        }
        if cursors.next[partition] <= offset {
            cursors.next[partition] = offset + 1;
        }
        Ok(())
    }

    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks, BrokerError> {
        let state = self.topic(topic).await?;
        let inner = state.inner.lock().await;
        let records = inner.partitions.get(partition as usize).ok_or_else(|| {
            BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            }
        })?;
        let high = records.len() as i64;
        let low = records
            .iter()
            .position(|r| !r.removed)
            .map(|i| i as i64)
            .unwrap_or(high);
        Ok(Watermarks { low, high })
    }

    async fn scan(
        &self,
        topic: &str,
        partition: u32,
        from_offset: i64,
        limit: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let state = self.topic(topic).await?;
        let inner = state.inner.lock().await;
        let records = inner.partitions.get(partition as usize).ok_or_else(|| {
            BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            }
        })?;
        let start = from_offset.max(0) as usize;
        Ok(records
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, r)| !r.removed)
            .take(limit)
            .map(|(offset, r)| Delivery {
                topic: topic.to_string(),
                partition,
                offset: offset as i64,
                key: r.key.clone(),
                payload: r.payload.clone(),
            })
            .collect())
    }

    async fn remove(&self, topic: &str, partition: u32, offset: i64) -> Result<bool, BrokerError> {
        let state = self.topic(topic).await?;
        let mut inner = state.inner.lock().await;
        let records = inner.partitions.get_mut(partition as usize).ok_or_else(|| {
            BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            }
        })?;
        if offset < 0 {
            return Ok(false);
        }
        match records.get_mut(offset as usize) {
            Some(record) if !record.removed => {
                record.removed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_topic(partitions: u32) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.ensure_topic("t", partitions).await.unwrap();
        broker.ensure_group("t", "g").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_fetch_commit() {
        let broker = broker_with_topic(1).await;
        let meta = broker.publish("t", Some("k"), b"one").await.unwrap();
        assert_eq!(meta.offset, 0);

        let delivery = broker.fetch("t", "g", 0).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"one");
        assert_eq!(delivery.key.as_deref(), Some("k"));

        broker.commit("t", "g", 0, delivery.offset).await.unwrap();
        assert!(broker.fetch("t", "g", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_record_is_redelivered() {
        let broker = broker_with_topic(1).await;
        broker.publish("t", None, b"payload").await.unwrap();

        let first = broker.fetch("t", "g", 0).await.unwrap().unwrap();
        let second = broker.fetch("t", "g", 0).await.unwrap().unwrap();
        assert_eq!(first.offset, second.offset);

        broker.commit("t", "g", 0, second.offset).await.unwrap();
        assert!(broker.fetch("t", "g", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_routing_keeps_one_key_on_one_partition() {
        let broker = broker_with_topic(2).await;
        let mut partitions = std::collections::HashSet::new();
        for _ in 0..5 {
            partitions.insert(broker.publish("t", Some("42"), b"x").await.unwrap().partition);
        }
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_watermarks_and_remove() {
        let broker = broker_with_topic(1).await;
        for payload in [b"a", b"b", b"c"] {
            broker.publish("t", None, payload).await.unwrap();
        }
        assert_eq!(
            broker.watermarks("t", 0).await.unwrap(),
            Watermarks { low: 0, high: 3 }
        );

        assert!(broker.remove("t", 0, 0).await.unwrap());
        assert!(!broker.remove("t", 0, 0).await.unwrap());
        assert!(!broker.remove("t", 0, 99).await.unwrap());

        // The low watermark moves past the removed head; the count keeps
        // the hole, matching the log-end arithmetic of the Redis broker.
        assert_eq!(
            broker.watermarks("t", 0).await.unwrap(),
            Watermarks { low: 1, high: 3 }
        );

        let scanned = broker.scan("t", 0, 0, 10).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].payload, b"b");
    }

    #[tokio::test]
    async fn test_fetch_skips_removed_records() {
        let broker = broker_with_topic(1).await;
        broker.publish("t", None, b"a").await.unwrap();
        broker.publish("t", None, b"b").await.unwrap();
        broker.remove("t", 0, 0).await.unwrap();

        let delivery = broker.fetch("t", "g", 0).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"b");
    }

    #[tokio::test]
    async fn test_unknown_topic_and_group() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("nope", None, b"x").await,
            Err(BrokerError::UnknownTopic(_))
        ));

        broker.ensure_topic("t", 1).await.unwrap();
        assert!(matches!(
            broker.fetch("t", "nope", 0).await,
            Err(BrokerError::UnknownGroup(_))
        ));
    }
}
