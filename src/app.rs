//! HTTP application served by each worker of the `prefork` binary.
//!
//! Every response names the worker pid that produced it, which makes the
//! kernel's connection spreading visible from the outside.

use axum::{Json, Router, routing::get};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::prefork::ProcessRole;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pid: u32,
    pub role: String,
}

async fn index() -> String {
    format!("hello from worker {}\n", std::process::id())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pid: std::process::id(),
        role: ProcessRole::detect().to_string(),
    })
}

/// Build the router: `/` and `/health`, with request tracing.
pub fn build_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}
