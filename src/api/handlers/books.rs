//! Book handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::{reject, Rejection};
use crate::api::ApiState;
use crate::books::UploadMessage;
use crate::model::{Book, BookUpload};

/// Apply a batch of book creates, updates and deletes.
///
/// Always answers 200; per-item failures are reported in the body.
pub async fn upload_books(
    State(state): State<Arc<ApiState>>,
    Json(items): Json<Vec<BookUpload>>,
) -> Json<BTreeMap<String, UploadMessage>> {
    Json(state.node.books().upload(items).await)
}

/// Get a book by its public record id.
pub async fn get_book(
    State(state): State<Arc<ApiState>>,
    Path(post_id): Path<String>,
) -> Result<Json<Book>, Rejection> {
    let book = state
        .node
        .books()
        .get(&post_id)
        .await
        .map_err(|e| reject("get_book", e))?;

    Ok(Json(book))
}

/// Get the part of a book one keeper holds: their custody details and
/// their copies only.
pub async fn get_keeper_book(
    State(state): State<Arc<ApiState>>,
    Path((post_id, keeper)): Path<(String, String)>,
) -> Result<Json<Book>, Rejection> {
    let book = state
        .node
        .books()
        .get_for_keeper(&post_id, &keeper)
        .await
        .map_err(|e| reject("get_keeper_book", e))?;

    Ok(Json(book))
}

/// Delete a book once every copy is back in stock.
pub async fn delete_book(
    State(state): State<Arc<ApiState>>,
    Path(post_id): Path<String>,
) -> Result<StatusCode, Rejection> {
    state
        .node
        .books()
        .delete(&post_id)
        .await
        .map_err(|e| reject("delete_book", e))?;

    Ok(StatusCode::NO_CONTENT)
}
