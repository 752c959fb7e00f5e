//! Loan handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{reject, Rejection};
use crate::api::ApiState;
use crate::borrow::StartedBorrow;

/// Start borrow request body.
#[derive(Debug, Deserialize)]
pub struct StartBorrowRequest {
    /// Public record id of the book.
    pub book_post_id: String,

    /// Borrowing user.
    pub borrower_user: String,
}

/// Open loans of one user.
#[derive(Debug, Serialize)]
pub struct ActiveLoansResponse {
    pub user: String,
    pub active: usize,

    /// 0 means no limit.
    pub limit: u32,
}

/// Start a loan.
pub async fn start_borrow(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<StartBorrowRequest>,
) -> Result<Json<StartedBorrow>, Rejection> {
    let started = state
        .node
        .borrows()
        .start(&req.book_post_id, &req.borrower_user)
        .await
        .map_err(|e| reject("start_borrow", e))?;

    Ok(Json(started))
}

/// Count a user's open loans.
pub async fn active_loans(
    State(state): State<Arc<ApiState>>,
    Path(user): Path<String>,
) -> Result<Json<ActiveLoansResponse>, Rejection> {
    let active = state
        .node
        .borrows()
        .active_loans(&user)
        .await
        .map_err(|e| reject("active_loans", e))?;

    Ok(Json(ActiveLoansResponse {
        user,
        active,
        limit: state.node.rules().borrow_limit,
    }))
}
