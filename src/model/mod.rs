//! Typed documents stored in the record store.
//!
//! - `book` - the three-part book aggregate and upload options
//! - `borrow` - borrow requests, envelopes and relation keys
//! - `workflow` - statuses, roles, steps and the transition table

pub mod book;
pub mod borrow;
pub mod workflow;

pub use book::{Book, BookInventory, BookPrivate, BookPublic, BookUpload, CopyStatus, Relations, UploadOptions};
pub use borrow::{Borrow, BorrowRequest, Dates, RelationKeys};
pub use workflow::{DateField, Effect, Role, Status, Step, Transition, WorkflowType, TRANSITIONS};

use std::time::{SystemTime, UNIX_EPOCH};

/// Search tag prefixes.
pub mod tags {
    pub const BORROWER: &str = "#b_";
    pub const LIBWORKER: &str = "#w_";
    pub const KEEPER: &str = "#k_";
    pub const STATUS: &str = "#s_";
    pub const COPY: &str = "#cp_";
    pub const ID: &str = "#id_";
    pub const CATEGORY1: &str = "#c1_";
    pub const CATEGORY2: &str = "#c2_";
    pub const CATEGORY3: &str = "#c3_";

    pub fn tag(prefix: &str, value: &str) -> String {
        format!("{}{}", prefix, value)
    }
}

/// Current time as Unix epoch millis.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
