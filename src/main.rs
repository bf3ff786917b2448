//! Operator API server.
//!
//! Hosts the administrative HTTP surface in front of the broker: status
//! and config inspection, test event injection, and DLQ listing, replay
//! and deletion. The pipeline workers run separately (see the `worker`
//! binary); this process only reads the log and appends to it.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use syncopate::api::{self, ApiContext};
use syncopate::broker;
use syncopate::config::AppConfig;
use syncopate::metrics::PipelineMetrics;
use syncopate::producer::EventProducer;
use syncopate::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() {
    // 1. Logging and environment
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    // 3. Broker connection and topic bootstrap
    let broker = broker::connect(&config.broker.url, "operator-api")
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

    // 4. Shared state
    let metrics = Arc::new(PipelineMetrics::new());
    let producer = EventProducer::new(broker.clone(), config.topics.primary.clone(), metrics.clone());
    let port = config.server.port;
    let state = Arc::new(ApiContext {
        broker,
        producer,
        metrics,
        config,
    });

    // 5. Serve until SIGTERM/SIGINT
    let app = api::router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("invalid address");

    info!("operator API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    let shutdown = ShutdownSignal::new();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .expect("server error");

    info!("operator API stopped");
}
