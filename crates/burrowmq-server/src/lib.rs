pub mod metrics;
pub mod sigv4;
pub mod tenant;
pub mod ui;
pub mod wire;

use axum::routing::post;
use axum::Router;
use burrowmq_storage::QueueEngine;
use std::sync::Arc;
use tenant::TenantDirectory;

#[derive(Clone)]
pub struct AppState {
    pub engine: QueueEngine,
    pub tenants: Arc<TenantDirectory>,
    pub region: String,
}

impl AppState {
    pub fn new(engine: QueueEngine, tenants: Arc<TenantDirectory>, region: String) -> Self {
        Self {
            engine,
            tenants,
            region,
        }
    }
}

/// The SQS-compatible listener: every POST, any path, through SigV4 then
/// target dispatch.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(wire::handle_api))
        .route("/*path", post(wire::handle_api))
        .with_state(state)
}

pub fn ui_router(state: AppState) -> Router {
    ui::router(state)
}
