//! REST API for the lending daemon.
//!
//! Provides HTTP endpoints for:
//! - Book upload and lookup, whole or per keeper
//! - Starting loans
//! - Workflow transitions and cancellation

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::node::LendingNode;

/// Shared state for API handlers.
pub struct ApiState {
    pub node: Arc<LendingNode>,
}

impl ApiState {
    pub fn new(node: LendingNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }
}

/// Build the API router with all routes.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Status/health
        .route("/api/v1/status", get(handlers::status::health))
        .route("/api/v1/config", get(handlers::status::lending_rules))
        // Books
        // Note: /upload must come before /:id to avoid matching "upload" as an ID
        .route("/api/v1/books/upload", post(handlers::books::upload_books))
        .route(
            "/api/v1/books/:id",
            get(handlers::books::get_book).delete(handlers::books::delete_book),
        )
        .route(
            "/api/v1/books/:id/keepers/:user",
            get(handlers::books::get_keeper_book),
        )
        // Loans
        .route("/api/v1/borrow", post(handlers::borrow::start_borrow))
        .route(
            "/api/v1/borrow/active/:user",
            get(handlers::borrow::active_loans),
        )
        // Workflow
        .route("/api/v1/workflow", post(handlers::workflow::transition))
        .route(
            "/api/v1/workflow/:master_id",
            delete(handlers::workflow::cancel),
        )
        // Middleware
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                // Only log responses that are not 2xx
                .on_request(())
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        let status = response.status();
                        if !status.is_success() {
                            tracing::warn!(
                                status = %status,
                                latency_ms = latency.as_millis(),
                                "request failed"
                            );
                        }
                    },
                ),
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("Lending API listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
