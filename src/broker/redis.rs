//! Broker implementation over Redis Streams.
//!
//! Each partition is one stream named `{topic}:{partition}`. Entry ids are
//! allocated explicitly from a per-partition counter, so an entry id is
//! always `{offset}-0` and offset arithmetic (watermarks, scans, removal)
//! works exactly like a numeric-offset log.
//!
//! Consumer groups map onto Redis consumer groups: `XREADGROUP` hands out
//! records, `XACK` commits them. Entries left pending by a consumer that
//! died are reclaimed with `XAUTOCLAIM` once they have been idle long
//! enough, which is what makes redelivery work across process restarts.

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{partition_for_key, Broker, BrokerError, Delivery, RecordMeta, Watermarks};

/// How long one fetch blocks waiting for new entries, in milliseconds.
const FETCH_BLOCK_MS: usize = 1000;

/// Idle time after which another consumer's pending entry is reclaimed.
const PENDING_IDLE_THRESHOLD_MS: u64 = 30_000;

/// Attempts to win the id race when concurrent producers append to the
/// same partition.
const PUBLISH_ATTEMPTS: u32 = 5;

/// [`Broker`] implementation backed by a pooled Redis client.
///
/// The pool is thread-safe and shared; clones of the broker handle are
/// cheap. `consumer_name` identifies this process inside consumer groups.
pub struct RedisBroker {
    pool: Pool,
    consumer_name: String,
}

impl RedisBroker {
    /// Create a broker from a `redis://` URL.
    pub fn connect(url: &str, consumer_name: &str) -> Result<Self, BrokerError> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            pool,
            consumer_name: consumer_name.to_string(),
        })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    fn stream_key(topic: &str, partition: u32) -> String {
        format!("{}:{}", topic, partition)
    }

    fn seq_key(topic: &str, partition: u32) -> String {
        format!("{}:{}:seq", topic, partition)
    }

    fn partitions_key(topic: &str) -> String {
        format!("{}:partitions", topic)
    }

    fn entry_id(offset: i64) -> String {
        format!("{}-0", offset.max(0))
    }

    /// Parse the offset out of a stream entry id (`"{offset}-0"`).
    fn offset_of(id: &str) -> Option<i64> {
        id.split('-').next().and_then(|ms| ms.parse().ok())
    }

    /// Try to claim one entry another consumer left pending for too long.
    async fn claim_pending(
        &self,
        conn: &mut deadpool_redis::Connection,
        stream: &str,
        group: &str,
    ) -> Option<(String, HashMap<String, RedisValue>)> {
        let result: Result<(String, Vec<(String, HashMap<String, RedisValue>)>), _> =
            cmd("XAUTOCLAIM")
                .arg(stream)
                .arg(group)
                .arg(&self.consumer_name)
                .arg(PENDING_IDLE_THRESHOLD_MS)
                .arg("0-0")
                .arg("COUNT")
                .arg(1)
                .query_async(conn)
                .await;

        match result {
            Ok((_, mut entries)) if !entries.is_empty() => {
                debug!(stream = %stream, "claimed a pending entry from a previous consumer");
                Some(entries.remove(0))
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "XAUTOCLAIM unavailable, skipping pending recovery");
                None
            }
        }
    }

    fn delivery_from_entry(
        topic: &str,
        partition: u32,
        id: &str,
        fields: &HashMap<String, RedisValue>,
    ) -> Option<Delivery> {
        let offset = Self::offset_of(id)?;
        let key = get_field(fields, "key").filter(|k| !k.is_empty());
        let payload = get_bytes_field(fields, "payload")?;
        Some(Delivery {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ensure_topic(&self, topic: &str, partitions: u32) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        // NX keeps the first-writer's partition count authoritative.
        let _: Option<String> = cmd("SET")
            .arg(Self::partitions_key(topic))
            .arg(partitions.max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), BrokerError> {
        let partitions = self.partitions(topic).await?;
        let mut conn = self.conn().await?;
        for partition in 0..partitions {
            // New groups start from the beginning of the log.
            let created: Result<(), _> = cmd("XGROUP")
                .arg("CREATE")
                .arg(Self::stream_key(topic, partition))
                .arg(group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            if let Err(e) = created {
                if !e.to_string().contains("BUSYGROUP") {
                    return Err(BrokerError::Command(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> Result<u32, BrokerError> {
        let mut conn = self.conn().await?;
        let partitions: Option<u32> = cmd("GET")
            .arg(Self::partitions_key(topic))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        partitions.ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<RecordMeta, BrokerError> {
        let partitions = self.partitions(topic).await?;
        let partition = match key {
            Some(key) => partition_for_key(key, partitions),
            None => 0,
        };
        let stream = Self::stream_key(topic, partition);
        let seq = Self::seq_key(topic, partition);
        let mut conn = self.conn().await?;

        // Allocate the offset, then append under that exact id. A concurrent
        // producer can win the race and make our id stale, in which case
        // Redis rejects the append and we allocate again.
        for _ in 0..PUBLISH_ATTEMPTS {
            let offset: i64 = cmd("INCR")
                .arg(&seq)
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Command(e.to_string()))?;

            let appended: Result<String, _> = cmd("XADD")
                .arg(&stream)
                .arg(Self::entry_id(offset))
                .arg("key")
                .arg(key.unwrap_or(""))
                .arg("payload")
                .arg(payload)
                .query_async(&mut conn)
                .await;

            match appended {
                Ok(_) => return Ok(RecordMeta { partition, offset }),
                Err(e) if e.to_string().contains("equal or smaller") => continue,
                Err(e) => return Err(BrokerError::Command(e.to_string())),
            }
        }
        Err(BrokerError::Command(format!(
            "could not allocate an entry id for '{}' after {} attempts",
            stream, PUBLISH_ATTEMPTS
        )))
    }

    async fn fetch(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<Option<Delivery>, BrokerError> {
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.conn().await?;

        if let Some((id, fields)) = self.claim_pending(&mut conn, &stream, group).await {
            return Ok(Self::delivery_from_entry(topic, partition, &id, &fields));
        }

        let opts = StreamReadOptions::default()
            .group(group, &self.consumer_name)
            .block(FETCH_BLOCK_MS)
            .count(1);

        let reply: Result<StreamReadReply, _> =
            conn.xread_options(&[&stream], &[">"], &opts).await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let message = e.to_string();
                if message.contains("NOGROUP") {
                    return Err(BrokerError::UnknownGroup(group.to_string()));
                }
                // A blocked read that times out surfaces as an error on some
                // client versions; treat it as an idle poll.
                if message.contains("timed out") || message.contains("response was nil") {
                    return Ok(None);
                }
                return Err(BrokerError::Command(message));
            }
        };

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                if let Some(delivery) =
                    Self::delivery_from_entry(topic, partition, &entry.id, &entry.map)
                {
                    return Ok(Some(delivery));
                }
                warn!(id = %entry.id, stream = %stream, "skipping stream entry with missing fields");
            }
        }
        Ok(None)
    }

    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), BrokerError> {
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .xack(&stream, group, &[Self::entry_id(offset)])
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(())
    }

    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks, BrokerError> {
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.conn().await?;

        // The counter is the source of truth for the high end: it survives
        // XDEL of the newest entries.
        let seq: Option<i64> = cmd("GET")
            .arg(Self::seq_key(topic, partition))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        let high = seq.unwrap_or(0) + 1;

        let first: Vec<(String, HashMap<String, RedisValue>)> = cmd("XRANGE")
            .arg(&stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        let low = first
            .first()
            .and_then(|(id, _)| Self::offset_of(id))
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
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.conn().await?;
        let entries: Vec<(String, HashMap<String, RedisValue>)> = cmd("XRANGE")
            .arg(&stream)
            .arg(Self::entry_id(from_offset))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;

        Ok(entries
            .iter()
            .filter_map(|(id, fields)| Self::delivery_from_entry(topic, partition, id, fields))
            .collect())
    }

    async fn remove(&self, topic: &str, partition: u32, offset: i64) -> Result<bool, BrokerError> {
        let stream = Self::stream_key(topic, partition);
        let mut conn = self.conn().await?;
        let removed: i64 = cmd("XDEL")
            .arg(&stream)
            .arg(Self::entry_id(offset))
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(e.to_string()))?;
        Ok(removed > 0)
    }
}

/// Extract a string field from stream entry data.
fn get_field(fields: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    match fields.get(key)? {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Extract a raw bytes field from stream entry data.
fn get_bytes_field(fields: &HashMap<String, RedisValue>, key: &str) -> Option<Vec<u8>> {
    match fields.get(key)? {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_roundtrip() {
        assert_eq!(RedisBroker::entry_id(42), "42-0");
        assert_eq!(RedisBroker::offset_of("42-0"), Some(42));
        assert_eq!(RedisBroker::offset_of("17"), Some(17));
        assert_eq!(RedisBroker::offset_of("nope"), None);
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(RedisBroker::stream_key("catalog:sync", 1), "catalog:sync:1");
        assert_eq!(RedisBroker::seq_key("catalog:sync", 1), "catalog:sync:1:seq");
        assert_eq!(RedisBroker::partitions_key("catalog:sync"), "catalog:sync:partitions");
    }

    #[test]
    fn test_field_extraction() {
        let mut fields = HashMap::new();
        fields.insert(
            "key".to_string(),
            RedisValue::BulkString(b"42".to_vec()),
        );
        fields.insert(
            "payload".to_string(),
            RedisValue::BulkString(br#"{"entityId":42,"action":"sync"}"#.to_vec()),
        );

        let delivery =
            RedisBroker::delivery_from_entry("catalog:sync", 0, "7-0", &fields).unwrap();
        assert_eq!(delivery.offset, 7);
        assert_eq!(delivery.key.as_deref(), Some("42"));
        assert_eq!(delivery.payload, br#"{"entityId":42,"action":"sync"}"#);
    }

    #[test]
    fn test_empty_key_field_means_no_key() {
        let mut fields = HashMap::new();
        fields.insert("key".to_string(), RedisValue::BulkString(Vec::new()));
        fields.insert("payload".to_string(), RedisValue::BulkString(b"{}".to_vec()));

        let delivery = RedisBroker::delivery_from_entry("t", 0, "1-0", &fields).unwrap();
        assert_eq!(delivery.key, None);
    }
}
