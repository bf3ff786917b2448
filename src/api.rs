//! Operator HTTP surface.
//!
//! Read endpoints report pipeline status and DLQ contents; administrative
//! endpoints inject test events and replay dead-lettered records. Aggregate
//! counts are computed on demand from the broker's own watermarks rather
//! than kept as separate counters, so they cannot drift from the log.
//!
//! Every endpoint answers a structured `{"success": ..., ...}` payload.
//! Client-input problems get a 400, broker trouble a 502.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::broker::{topic_record_count, Broker};
use crate::config::AppConfig;
use crate::dlq::{self, DlqRecord, DLQ_PARTITION};
use crate::event::{SyncAction, SyncEvent};
use crate::index::PROBE_ENTITY_ID;
use crate::metrics::PipelineMetrics;
use crate::producer::EventProducer;

/// Shared state behind the operator endpoints.
pub struct ApiContext {
    pub broker: Arc<dyn Broker>,
    pub producer: EventProducer,
    pub metrics: Arc<PipelineMetrics>,
    pub config: AppConfig,
}

type ApiResponse = (StatusCode, Json<Value>);

/// Build the operator router.
pub fn router(state: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/config", get(show_config))
        .route("/test/send", post(test_send))
        .route("/test/error", post(test_error))
        .route("/dlq/retry", post(dlq_retry))
        .route("/dlq/messages", get(dlq_messages))
        .route("/dlq/messages/{offset}", delete(dlq_delete))
        .route("/dlq/stats", get(dlq_stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<ApiContext>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.config.server.api_key.as_deref() else {
        // No key configured: open surface, development only.
        return Ok(next.run(req).await);
    };

    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header {
        Some(value) if value.starts_with("Bearer ") && &value[7..] == api_key => {
            Ok(next.run(req).await)
        }
        Some(_) => {
            warn!("invalid API key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({ "success": false, "message": message.into() })),
    )
}

async fn health(State(state): State<Arc<ApiContext>>) -> ApiResponse {
    match state.broker.partitions(&state.config.topics.primary).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "broker": "connected" })),
        ),
        Err(e) => {
            error!(error = %e, "health probe failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "broker unreachable")
        }
    }
}

async fn status(State(state): State<Arc<ApiContext>>) -> ApiResponse {
    let topics = &state.config.topics;

    let total = match topic_record_count(state.broker.as_ref(), &topics.primary).await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "status query failed");
            return failure(StatusCode::BAD_GATEWAY, format!("status query failed: {e}"));
        }
    };
    let dlq_count = match topic_record_count(state.broker.as_ref(), &topics.dlq).await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "status query failed");
            return failure(StatusCode::BAD_GATEWAY, format!("status query failed: {e}"));
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "timestamp": Utc::now().timestamp_millis(),
            "status": "HEALTHY",
            "uptimeSeconds": state.metrics.uptime_seconds(),
            "topics": {
                "original": topics.primary,
                "dlq": topics.dlq,
            },
            "stats": {
                "totalMessages": total,
                "successMessages": (total - dlq_count).max(0),
                "failedMessages": dlq_count,
                "dlqMessages": dlq_count,
            },
            "counters": state.metrics.snapshot(),
        })),
    )
}

async fn show_config(State(state): State<Arc<ApiContext>>) -> ApiResponse {
    let config = &state.config;
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "topics": {
                "original": config.topics.primary,
                "dlq": config.topics.dlq,
                "partitions": config.topics.partitions,
            },
            "groups": {
                "primary": config.consumer.group,
                "dlq": config.consumer.dlq_group,
            },
            "retry": {
                "initialMs": config.retry.initial_ms,
                "multiplier": config.retry.multiplier,
                "maxIntervalMs": config.retry.max_interval_ms,
                "maxElapsedMs": config.retry.max_elapsed_ms,
            },
            "features": {
                "errorHandling": true,
                "retryMechanism": true,
                "dlqSupport": true,
                "manualCommit": true,
                "monitoring": true,
            },
        })),
    )
}

#[derive(Debug, Deserialize)]
struct TestSendRequest {
    #[serde(rename = "entityId")]
    entity_id: i64,

    #[serde(default = "default_action")]
    action: String,
}

fn default_action() -> String {
    "sync".to_string()
}

async fn test_send(
    State(state): State<Arc<ApiContext>>,
    Json(request): Json<TestSendRequest>,
) -> ApiResponse {
    let Some(action) = SyncAction::parse(&request.action) else {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("unsupported action '{}'", request.action),
        );
    };

    match state.producer.publish(request.entity_id, action).await {
        Ok(meta) => {
            info!(
                entity_id = request.entity_id,
                action = action.as_str(),
                offset = meta.offset,
                "test event published"
            );
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "test event published",
                    "entityId": request.entity_id,
                    "action": action.as_str(),
                    "partition": meta.partition,
                    "offset": meta.offset,
                })),
            )
        }
        Err(e) => {
            error!(error = %e, "test event publish failed");
            failure(StatusCode::BAD_GATEWAY, format!("publish failed: {e}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestErrorRequest {
    #[serde(rename = "entityId", default = "default_test_entity")]
    entity_id: i64,

    #[serde(rename = "errorType", default = "default_error_type")]
    error_type: String,
}

fn default_test_entity() -> i64 {
    1
}

fn default_error_type() -> String {
    "transient".to_string()
}

async fn test_error(
    State(state): State<Arc<ApiContext>>,
    Json(request): Json<TestErrorRequest>,
) -> ApiResponse {
    // Each shape provokes one failure path: a payload the validator can
    // never accept, a null action, or a well-formed event the index fails
    // transiently so the retry ladder runs.
    let payload = match request.error_type.to_lowercase().as_str() {
        "validation" => json!({ "entityId": null, "action": "invalid_action" }),
        "null" => json!({ "entityId": request.entity_id, "action": null }),
        "transient" => {
            json!(SyncEvent::sync(PROBE_ENTITY_ID))
        }
        other => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("unsupported errorType '{other}'"),
            );
        }
    };

    let bytes = payload.to_string().into_bytes();
    match state.producer.publish_raw(None, &bytes).await {
        Ok(meta) => {
            info!(error_type = %request.error_type, offset = meta.offset, "error test event published");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "error test event published",
                    "errorType": request.error_type,
                    "testEvent": payload,
                    "partition": meta.partition,
                    "offset": meta.offset,
                })),
            )
        }
        Err(e) => {
            error!(error = %e, "error test publish failed");
            failure(StatusCode::BAD_GATEWAY, format!("publish failed: {e}"))
        }
    }
}

async fn dlq_retry(
    State(state): State<Arc<ApiContext>>,
    Json(record): Json<DlqRecord>,
) -> ApiResponse {
    info!(summary = %record.summary(), "manual DLQ replay requested");

    match dlq::replay(state.broker.as_ref(), &record).await {
        Ok(meta) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "DLQ record replayed",
                "originalTopic": record.original_topic,
                "partition": meta.partition,
                "offset": meta.offset,
                "retryTimestamp": Utc::now().timestamp_millis(),
            })),
        ),
        Err(e) => {
            error!(error = %e, summary = %record.summary(), "DLQ replay failed");
            failure(StatusCode::BAD_GATEWAY, format!("replay failed: {e}"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    page: usize,

    #[serde(default = "default_page_size")]
    size: usize,
}

fn default_page_size() -> usize {
    10
}

async fn dlq_messages(
    State(state): State<Arc<ApiContext>>,
    Query(pagination): Query<Pagination>,
) -> ApiResponse {
    if pagination.size == 0 {
        return failure(StatusCode::BAD_REQUEST, "size must be at least 1");
    }

    let dlq_topic = &state.config.topics.dlq;
    let watermarks = match state.broker.watermarks(dlq_topic, DLQ_PARTITION).await {
        Ok(watermarks) => watermarks,
        Err(e) => {
            error!(error = %e, "DLQ listing failed");
            return failure(StatusCode::BAD_GATEWAY, format!("DLQ listing failed: {e}"));
        }
    };

    let window = pagination.page * pagination.size + pagination.size;
    let scanned = match state
        .broker
        .scan(dlq_topic, DLQ_PARTITION, watermarks.low, window)
        .await
    {
        Ok(scanned) => scanned,
        Err(e) => {
            error!(error = %e, "DLQ listing failed");
            return failure(StatusCode::BAD_GATEWAY, format!("DLQ listing failed: {e}"));
        }
    };

    let entries: Vec<Value> = scanned
        .iter()
        .skip(pagination.page * pagination.size)
        .take(pagination.size)
        .map(|delivery| match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(mut record) => {
                if let Some(object) = record.as_object_mut() {
                    object.insert("offset".to_string(), json!(delivery.offset));
                }
                record
            }
            Err(_) => json!({
                "offset": delivery.offset,
                "raw": String::from_utf8_lossy(&delivery.payload),
            }),
        })
        .collect();

    let total = watermarks.count();
    let total_pages = (total as usize).div_ceil(pagination.size);

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": entries,
            "pagination": {
                "page": pagination.page,
                "size": pagination.size,
                "total": total,
                "totalPages": total_pages,
            },
            "timestamp": Utc::now().timestamp_millis(),
        })),
    )
}

/// How many records the stats endpoint inspects.
const STATS_WINDOW: usize = 100;

async fn dlq_stats(State(state): State<Arc<ApiContext>>) -> ApiResponse {
    let dlq_topic = &state.config.topics.dlq;
    let watermarks = match state.broker.watermarks(dlq_topic, DLQ_PARTITION).await {
        Ok(watermarks) => watermarks,
        Err(e) => {
            error!(error = %e, "DLQ stats failed");
            return failure(StatusCode::BAD_GATEWAY, format!("DLQ stats failed: {e}"));
        }
    };

    let scanned = match state
        .broker
        .scan(dlq_topic, DLQ_PARTITION, watermarks.low, STATS_WINDOW)
        .await
    {
        Ok(scanned) => scanned,
        Err(e) => {
            error!(error = %e, "DLQ stats failed");
            return failure(StatusCode::BAD_GATEWAY, format!("DLQ stats failed: {e}"));
        }
    };

    let records: Vec<DlqRecord> = scanned
        .iter()
        .filter_map(|delivery| serde_json::from_slice(&delivery.payload).ok())
        .collect();

    let mut error_stats = serde_json::Map::new();
    for record in &records {
        let counter = error_stats
            .entry(record.error_class.clone())
            .or_insert(json!(0));
        if let Some(count) = counter.as_i64() {
            *counter = json!(count + 1);
        }
    }

    let recent: Vec<Value> = records
        .iter()
        .rev()
        .take(5)
        .map(|record| json!(record))
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "totalDlqMessages": watermarks.count(),
            "errorTypeStats": error_stats,
            "recentFailures": recent,
            "timestamp": Utc::now().timestamp_millis(),
        })),
    )
}

async fn dlq_delete(
    State(state): State<Arc<ApiContext>>,
    Path(offset): Path<i64>,
) -> ApiResponse {
    let dlq_topic = &state.config.topics.dlq;
    match state.broker.remove(dlq_topic, DLQ_PARTITION, offset).await {
        Ok(removed) => {
            info!(offset, removed, "DLQ record delete requested");
            let message = if removed {
                "DLQ record deleted"
            } else {
                "no DLQ record at that offset"
            };
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": message,
                    "deletedOffset": offset,
                    "removed": removed,
                })),
            )
        }
        Err(e) => {
            error!(error = %e, offset, "DLQ record delete failed");
            failure(StatusCode::BAD_GATEWAY, format!("delete failed: {e}"))
        }
    }
}
