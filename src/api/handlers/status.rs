//! Status and health check handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::ApiState;
use crate::model::now_millis;
use crate::node::LendingRules;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Package version.
    pub version: String,

    /// Seconds since the node started.
    pub uptime_secs: u64,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let uptime_ms = now_millis().saturating_sub(state.node.started_at());

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime_ms / 1000,
    })
}

/// Lending rules clients display to users.
pub async fn lending_rules(State(state): State<Arc<ApiState>>) -> Json<LendingRules> {
    Json(state.node.rules())
}
