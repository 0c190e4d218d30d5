//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::dispatcher::Dispatcher;
use crate::protocol::RawMessage;

/// Shared application state
pub struct AppState {
    /// Call dispatcher
    pub dispatcher: Arc<Dispatcher>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /mcp: one JSON-RPC message in, its reply out
async fn mcp_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match state.dispatcher.handle(RawMessage::inbound(body)).await {
        Some(reply) => Json(reply).into_response(),
        // Notifications and unclassified traffic get no body
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let routes = state.dispatcher.routes();
    let degraded = !routes.catalog.warnings.is_empty();
    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "connectors": routes.connectors.len(),
        "tools": routes.catalog.tools.len(),
        "in_flight": state.dispatcher.in_flight(),
    }))
}
