//! End-to-end pipeline scenarios against the in-memory broker.
//!
//! Time-dependent tests run with a paused tokio clock, so backoff sleeps
//! advance virtually and the 30-second retry budget elapses in
//! milliseconds of real time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use syncopate::broker::{self, Broker, MemoryBroker};
use syncopate::consumer::SyncConsumer;
use syncopate::dlq::{self, DlqRecord, DlqRouter, ProcessingStatus, DLQ_PARTITION};
use syncopate::event::SyncAction;
use syncopate::index::{IndexError, SearchIndex};
use syncopate::metrics::PipelineMetrics;
use syncopate::producer::EventProducer;
use syncopate::retry::RetryPolicy;
use syncopate::shutdown::ShutdownSignal;
use syncopate::triage::{self, AlertError, AlertSink, DlqConsumer};

const PRIMARY: &str = "catalog:sync";
const DLQ: &str = "catalog:sync:dlq";
const GROUP: &str = "catalog_sync_workers";
const DLQ_GROUP: &str = "catalog_dlq_triage";
const PARTITIONS: u32 = 2;

/// How the fake index behaves.
#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Healthy,
    AlwaysTimeout,
}

/// Search index double that records every call.
struct TestIndex {
    mode: Mode,
    ops: Mutex<Vec<(&'static str, i64)>>,
}

impl TestIndex {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            ops: Mutex::new(Vec::new()),
        }
    }

    fn ops(&self) -> Vec<(&'static str, i64)> {
        self.ops.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), IndexError> {
        match self.mode {
            Mode::Healthy => Ok(()),
            Mode::AlwaysTimeout => Err(IndexError::Timeout(
                "search cluster did not respond".to_string(),
            )),
        }
    }
}

#[async_trait]
impl SearchIndex for TestIndex {
    fn name(&self) -> &str {
        "test-index"
    }

    async fn sync_entity(&self, entity_id: i64) -> Result<(), IndexError> {
        self.check()?;
        self.ops.lock().unwrap().push(("sync", entity_id));
        Ok(())
    }

    async fn delete_entity(&self, entity_id: i64) -> Result<(), IndexError> {
        self.check()?;
        self.ops.lock().unwrap().push(("delete", entity_id));
        Ok(())
    }
}

struct Harness {
    broker: Arc<dyn Broker>,
    index: Arc<TestIndex>,
    metrics: Arc<PipelineMetrics>,
    producer: EventProducer,
    shutdown: ShutdownSignal,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    /// Broker, topics, groups and one consumer worker per partition.
    async fn start(mode: Mode) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        broker.ensure_topic(PRIMARY, PARTITIONS).await.unwrap();
        broker.ensure_topic(DLQ, 1).await.unwrap();
        broker.ensure_group(PRIMARY, GROUP).await.unwrap();
        broker.ensure_group(DLQ, DLQ_GROUP).await.unwrap();

        let metrics = Arc::new(PipelineMetrics::new());
        let index = Arc::new(TestIndex::new(mode));
        let router = Arc::new(DlqRouter::new(broker.clone(), DLQ, metrics.clone()));
        let consumer = Arc::new(SyncConsumer::new(
            broker.clone(),
            PRIMARY,
            GROUP,
            index.clone(),
            RetryPolicy::default(),
            router,
            metrics.clone(),
        ));

        let shutdown = ShutdownSignal::new();
        let handles = consumer.spawn_workers(PARTITIONS, &shutdown);
        let producer = EventProducer::new(broker.clone(), PRIMARY, metrics.clone());

        Self {
            broker,
            index,
            metrics,
            producer,
            shutdown,
            handles,
        }
    }

    async fn dlq_count(&self) -> i64 {
        broker::topic_record_count(self.broker.as_ref(), DLQ)
            .await
            .unwrap()
    }

    /// First record in the DLQ, parsed.
    async fn first_dlq_record(&self) -> DlqRecord {
        let scanned = self.broker.scan(DLQ, DLQ_PARTITION, 0, 1).await.unwrap();
        serde_json::from_slice(&scanned[0].payload).unwrap()
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(60), handle)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }
}

/// Poll a condition while virtual time advances.
macro_rules! wait_until {
    ($cond:expr) => {
        let mut satisfied = false;
        for _ in 0..2000 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(satisfied, "condition not reached: {}", stringify!($cond));
    };
}

// Scenario: a healthy collaborator processes a published event exactly
// once, the offset is committed, and the DLQ stays empty.
#[tokio::test(start_paused = true)]
async fn healthy_event_is_processed_and_committed() {
    let harness = Harness::start(Mode::Healthy).await;

    harness.producer.publish(42, SyncAction::Sync).await.unwrap();

    wait_until!(harness.index.ops().contains(&("sync", 42)));
    assert_eq!(harness.dlq_count().await, 0);
    assert_eq!(harness.metrics.events_processed(), 1);

    let broker = harness.broker.clone();
    harness.stop().await;

    // Committed: nothing is redelivered to the group afterwards.
    for partition in 0..PARTITIONS {
        assert!(broker
            .fetch(PRIMARY, GROUP, partition)
            .await
            .unwrap()
            .is_none());
    }
}

// Scenario: a persistently transient failure exhausts the 30s budget and
// lands in the DLQ classified as retry-exhausted and transient-looking.
#[tokio::test(start_paused = true)]
async fn transient_failure_exhausts_budget_into_dlq() {
    let harness = Harness::start(Mode::AlwaysTimeout).await;
    let started = tokio::time::Instant::now();

    harness.producer.publish(42, SyncAction::Sync).await.unwrap();

    wait_until!(harness.dlq_count().await == 1);
    assert!(
        started.elapsed() >= Duration::from_secs(30),
        "budget ended early at {:?}",
        started.elapsed()
    );

    let record = harness.first_dlq_record().await;
    assert_eq!(record.processing_status, ProcessingStatus::RetryExhausted);
    assert_eq!(record.error_class, "IndexTimeout");
    assert_eq!(record.original_topic, PRIMARY);
    assert_eq!(record.original_value["entityId"], 42);
    // The 1,2,4,8,10,10 ladder means at least five retries ran.
    assert!(record.retry_count >= 5, "retry_count = {}", record.retry_count);
    assert!(triage::is_retryable(&record));

    harness.stop().await;
}

// Scenario: a payload that fails validation goes straight to the DLQ with
// zero retries, and the index is never called.
#[tokio::test(start_paused = true)]
async fn invalid_event_goes_straight_to_dlq() {
    let harness = Harness::start(Mode::Healthy).await;

    harness
        .broker
        .publish(
            PRIMARY,
            None,
            br#"{"entityId": null, "action": "invalid_action"}"#,
        )
        .await
        .unwrap();

    wait_until!(harness.dlq_count().await == 1);

    let record = harness.first_dlq_record().await;
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert_eq!(record.error_class, "ValidationError");
    assert!(!triage::is_retryable(&record));
    assert!(harness.index.ops().is_empty());

    harness.stop().await;
}

// Scenario: an out-of-range entity id is permanent too, not retried.
#[tokio::test(start_paused = true)]
async fn non_positive_entity_id_is_rejected_without_retry() {
    let harness = Harness::start(Mode::Healthy).await;
    let started = tokio::time::Instant::now();

    harness
        .broker
        .publish(PRIMARY, None, br#"{"entityId": -999, "action": "sync"}"#)
        .await
        .unwrap();

    wait_until!(harness.dlq_count().await == 1);
    // Well under the retry budget: no backoff loop ran.
    assert!(started.elapsed() < Duration::from_secs(30));

    let record = harness.first_dlq_record().await;
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.processing_status, ProcessingStatus::Failed);
    assert_eq!(record.error_class, "ValidationError");

    harness.stop().await;
}

// Scenario: replaying a DLQ record republishes the original value
// unchanged to the original topic and leaves the record in place.
#[tokio::test]
async fn replay_republishes_original_value_verbatim() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    broker.ensure_topic(PRIMARY, PARTITIONS).await.unwrap();
    broker.ensure_topic(DLQ, 1).await.unwrap();

    let original_value = json!({"entityId": 42, "action": "sync"});
    let record = DlqRecord {
        original_topic: PRIMARY.to_string(),
        original_partition: 0,
        original_offset: 17,
        original_key: Some("42".to_string()),
        original_value: original_value.clone(),
        error_message: "search cluster did not respond".to_string(),
        error_class: "IndexTimeout".to_string(),
        failure_timestamp: 1_700_000_000_000,
        retry_count: 6,
        processing_status: ProcessingStatus::RetryExhausted,
    };

    let meta = dlq::replay(broker.as_ref(), &record).await.unwrap();

    let replayed = broker
        .scan(PRIMARY, meta.partition, meta.offset, 1)
        .await
        .unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].key.as_deref(), Some("42"));
    let payload: Value = serde_json::from_slice(&replayed[0].payload).unwrap();
    assert_eq!(payload, original_value);
}

/// Alert sink that always fails, for the always-acknowledge property.
struct FailingAlert;

#[async_trait]
impl AlertSink for FailingAlert {
    fn name(&self) -> &str {
        "failing"
    }

    async fn notify(&self, _record: &DlqRecord) -> Result<(), AlertError> {
        Err(AlertError::Status(500))
    }
}

// The DLQ consumer acknowledges every record: parse failures and broken
// alert hooks never stall the queue.
#[tokio::test(start_paused = true)]
async fn dlq_consumer_always_acknowledges() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    broker.ensure_topic(DLQ, 1).await.unwrap();
    broker.ensure_group(DLQ, DLQ_GROUP).await.unwrap();

    // One record that does not even parse, one that does.
    broker.publish(DLQ, None, b"garbage, not a record").await.unwrap();
    let record = DlqRecord {
        original_topic: PRIMARY.to_string(),
        original_partition: 0,
        original_offset: 3,
        original_key: None,
        original_value: json!({"entityId": 7, "action": "delete"}),
        error_message: "connection refused".to_string(),
        error_class: "IndexConnection".to_string(),
        failure_timestamp: 1_700_000_000_000,
        retry_count: 2,
        processing_status: ProcessingStatus::RetryExhausted,
    };
    broker
        .publish(DLQ, None, &serde_json::to_vec(&record).unwrap())
        .await
        .unwrap();

    let metrics = Arc::new(PipelineMetrics::new());
    let consumer = DlqConsumer::new(broker.clone(), DLQ, DLQ_GROUP, metrics.clone())
        .with_alert(Arc::new(FailingAlert));

    let shutdown = ShutdownSignal::new();
    let handle = consumer.spawn(&shutdown);

    wait_until!(metrics.dlq_triaged() >= 1);
    // Give the loop a chance to commit the second record as well.
    tokio::time::sleep(Duration::from_secs(2)).await;

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("triage worker did not stop")
        .unwrap();

    // Both records were acknowledged, nothing is pending for the group.
    assert!(broker.fetch(DLQ, DLQ_GROUP, 0).await.unwrap().is_none());
}

// Events for one entity arrive at the index in publish order.
#[tokio::test(start_paused = true)]
async fn per_entity_ordering_is_preserved() {
    let harness = Harness::start(Mode::Healthy).await;

    harness.producer.publish(7, SyncAction::Sync).await.unwrap();
    harness.producer.publish(7, SyncAction::Delete).await.unwrap();
    harness.producer.publish(7, SyncAction::Sync).await.unwrap();

    wait_until!(harness.index.ops().len() == 3);
    assert_eq!(
        harness.index.ops(),
        vec![("sync", 7), ("delete", 7), ("sync", 7)]
    );

    harness.stop().await;
}
