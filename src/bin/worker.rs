//! Pipeline worker.
//!
//! Runs the consumer side of the pipeline: one partition worker per
//! primary-topic partition plus the single DLQ triage worker. Scale out by
//! running more worker processes against the same consumer group; the
//! broker hands each partition to one consumer at a time.
//!
//! ## Configuration
//!
//! `config/syncopate.toml` (or `SYNCOPATE_CONFIG`), plus:
//! - `SYNCOPATE_WORKER_NAME`: unique worker identifier (default: hostname
//!   or a random id)
//! - `RUST_LOG`: logging level

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use syncopate::broker;
use syncopate::config::AppConfig;
use syncopate::consumer::SyncConsumer;
use syncopate::dlq::DlqRouter;
use syncopate::index::LoggingIndex;
use syncopate::metrics::PipelineMetrics;
use syncopate::shutdown::ShutdownSignal;
use syncopate::triage::{DlqConsumer, WebhookAlert};

/// Resolve this worker's identity: config, env, hostname, random id.
fn worker_name(config: &AppConfig) -> String {
    if let Some(name) = &config.consumer.name {
        return name.clone();
    }
    if let Ok(name) = env::var("SYNCOPATE_WORKER_NAME") {
        return name;
    }
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }
    format!("worker-{}", uuid::Uuid::new_v4())
}

#[tokio::main]
async fn main() {
    // 1. Logging and environment
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Configuration and identity
    let config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });
    let name = worker_name(&config);

    info!(
        worker = %name,
        group = %config.consumer.group,
        broker = %config.broker.url,
        "pipeline worker starting"
    );

    // 3. Broker connection, topics and groups
    let broker = broker::connect(&config.broker.url, &name)
        .await
        .expect("failed to connect to broker");
    broker
        .ensure_topic(&config.topics.primary, config.topics.partitions)
        .await
        .expect("failed to create primary topic");
    broker
        .ensure_topic(&config.topics.dlq, 1)
        .await
        .expect("failed to create DLQ topic");
    broker
        .ensure_group(&config.topics.primary, &config.consumer.group)
        .await
        .expect("failed to create consumer group");
    broker
        .ensure_group(&config.topics.dlq, &config.consumer.dlq_group)
        .await
        .expect("failed to create DLQ consumer group");

    // 4. Pipeline wiring
    let metrics = Arc::new(PipelineMetrics::new());
    let index = Arc::new(LoggingIndex::new());
    let router = Arc::new(DlqRouter::new(
        broker.clone(),
        config.topics.dlq.clone(),
        metrics.clone(),
    ));
    let consumer = Arc::new(SyncConsumer::new(
        broker.clone(),
        config.topics.primary.clone(),
        config.consumer.group.clone(),
        index,
        config.retry_policy(),
        router,
        metrics.clone(),
    ));

    let mut dlq_consumer = DlqConsumer::new(
        broker.clone(),
        config.topics.dlq.clone(),
        config.consumer.dlq_group.clone(),
        metrics.clone(),
    );
    if let Some(webhook) = &config.alerts.webhook {
        dlq_consumer = dlq_consumer.with_alert(Arc::new(
            WebhookAlert::new(&webhook.url)
                .with_timeout(Duration::from_millis(webhook.timeout_ms)),
        ));
    }

    // 5. Run until SIGTERM/SIGINT
    let shutdown = ShutdownSignal::new();
    let mut handles = consumer.spawn_workers(config.topics.partitions, &shutdown);
    handles.push(dlq_consumer.spawn(&shutdown));

    info!(
        topic = %config.topics.primary,
        partitions = config.topics.partitions,
        "pipeline worker running"
    );

    shutdown.wait().await;

    // Let each worker finish its in-flight message before exiting.
    for handle in handles {
        if tokio::time::timeout(shutdown.timeout(), handle).await.is_err() {
            warn!("a worker did not stop within the shutdown grace period");
        }
    }

    info!("pipeline worker stopped");
}
