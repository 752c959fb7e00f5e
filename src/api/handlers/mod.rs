//! API request handlers.

pub mod books;
pub mod borrow;
pub mod status;
pub mod workflow;

use axum::http::StatusCode;

use crate::error::{ErrorKind, LendingError};

/// Rejection returned by every handler.
pub type Rejection = (StatusCode, String);

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::LockConflict => StatusCode::CONFLICT,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Store => StatusCode::BAD_GATEWAY,
        ErrorKind::PartialWriteFailure | ErrorKind::FatalInconsistency => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Map a lending error to a response, logging the ones a client can't fix.
pub(crate) fn reject(op: &'static str, err: LendingError) -> Rejection {
    let kind = err.kind();
    match kind {
        ErrorKind::NotFound | ErrorKind::LockConflict | ErrorKind::Validation => {
            tracing::debug!(op, kind = kind.as_str(), error = %err, "Request rejected");
        }
        _ => {
            tracing::error!(op, kind = kind.as_str(), error = %err, "Request failed");
        }
    }
    (status_for(kind), err.to_string())
}
