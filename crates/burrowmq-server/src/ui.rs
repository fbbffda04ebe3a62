//! Dashboard listener: the JSON surface the management UI consumes plus
//! health, metrics and the snapshot admin endpoints. Everything goes
//! through the engine; the ambient operator tenant scopes every call.

use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use burrowmq_core::{FilterCriteria, QueueError};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/queues", get(list_queues).post(create_queue))
        .route("/api/queues/:name", axum::routing::delete(delete_queue))
        .route("/api/queues/:name/stats", get(queue_stats))
        .route("/api/queues/:name/messages", get(filter_messages))
        .route("/api/queues/:name/messages/:id", get(peek_message))
        .route("/admin/snapshot", post(admin_snapshot))
        .route("/admin/manifest", get(admin_manifest))
        .route("/admin/trim-wal", post(admin_trim_wal))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

fn error_response(e: QueueError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        QueueError::QueueNotFound | QueueError::MessageNotFound => StatusCode::NOT_FOUND,
        QueueError::QueueAlreadyExists => StatusCode::CONFLICT,
        QueueError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
        QueueError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    let _ = encoder.encode(&metric_families, &mut buf);
    (StatusCode::OK, String::from_utf8(buf).unwrap_or_default())
}

async fn list_queues(State(app): State<AppState>) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    match app.engine.list_queues(tenant).await {
        Ok(names) => (StatusCode::OK, Json(json!({"queues": names}))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct CreateQueueBody {
    name: String,
    #[serde(default)]
    visibility_timeout: Option<u32>,
    #[serde(default)]
    delay_seconds: Option<u32>,
}

async fn create_queue(
    State(app): State<AppState>,
    Json(req): Json<CreateQueueBody>,
) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    match app
        .engine
        .create_queue(tenant, &req.name, req.visibility_timeout, req.delay_seconds)
        .await
    {
        Ok(cfg) => (StatusCode::OK, Json(json!({"name": cfg.name}))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn delete_queue(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    match app.engine.delete_queue(tenant, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn queue_stats(State(app): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    match app.engine.stats(tenant, &name).await {
        Ok(stats) => (StatusCode::OK, Json(json!(stats))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Query params are attribute equality filters; `message_id` pins a single
/// id. `GET /api/queues/q/messages?kind=audit&message_id=3`
async fn filter_messages(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    let mut criteria = FilterCriteria::default();
    for (k, v) in params {
        if k == "message_id" {
            match v.parse() {
                Ok(id) => criteria.message_id = id,
                Err(_) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "message_id must be an integer"})),
                    )
                        .into_response()
                }
            }
        } else {
            criteria.attributes.insert(k, v);
        }
    }
    match app.engine.filter(tenant, &name, &criteria).await {
        Ok(ids) => (StatusCode::OK, Json(json!({"ids": ids}))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn peek_message(
    State(app): State<AppState>,
    Path((name, id)): Path<(String, u64)>,
) -> impl IntoResponse {
    let tenant = app.tenants.current_tenant();
    match app.engine.peek(tenant, &name, id).await {
        Ok(Some(msg)) => {
            let body = json!({
                "id": msg.id,
                "queue": msg.queue,
                "body": String::from_utf8_lossy(&msg.body),
                "attributes": crate::wire::encode_attributes(&msg.attributes),
                "state": msg.state,
                "visible_at": msg.visible_at,
                "enqueued_at": msg.enqueued_at,
                "deliveries": msg.deliveries,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "message not found"})),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn admin_snapshot(State(app): State<AppState>) -> impl IntoResponse {
    match app.engine.snapshot().await {
        Ok((id, last_seq)) => (
            StatusCode::OK,
            Json(json!({"snapshot_id": id, "last_seq": last_seq})),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn admin_manifest(State(app): State<AppState>) -> impl IntoResponse {
    match app.engine.manifest().await {
        Ok(m) => (StatusCode::OK, Json(m)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn admin_trim_wal(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let sid = params.get("snapshot_id").cloned().unwrap_or_default();
    if sid.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing snapshot_id"})),
        )
            .into_response();
    }
    match app.engine.trim_wal(&sid).await {
        Ok(deleted) => (StatusCode::OK, Json(json!({"deleted": deleted}))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
