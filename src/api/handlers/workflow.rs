//! Workflow handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use super::{reject, Rejection};
use crate::api::ApiState;
use crate::workflow::{CancelOutcome, TransitionOutcome, WorkflowRequest};

/// Cancel query parameters.
#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    /// User cancelling the loan.
    pub act_user: String,
}

/// Move a loan to its next status.
pub async fn transition(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<WorkflowRequest>,
) -> Result<Json<TransitionOutcome>, Rejection> {
    let outcome = state
        .node
        .workflow()
        .transition(req)
        .await
        .map_err(|e| reject("transition", e))?;

    Ok(Json(outcome))
}

/// Cancel a loan and delete every copy of it.
pub async fn cancel(
    State(state): State<Arc<ApiState>>,
    Path(master_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<CancelOutcome>, Rejection> {
    let outcome = state
        .node
        .workflow()
        .cancel(&master_id, &query.act_user)
        .await
        .map_err(|e| reject("cancel", e))?;

    Ok(Json(outcome))
}
