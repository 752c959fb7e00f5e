//! Record store adapter.
//!
//! The lending engines only see typed get/create/update/delete/search over
//! structured documents. The store offers no multi-record transactions and no
//! locking; both are layered on top by [`crate::lock`] and
//! [`crate::compensation`].
//!
//! - `identity` - username to display name lookup
//! - `memory` - in-process store with an optional JSON snapshot, used by the
//!   daemon and the tests

pub mod identity;
pub mod memory;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use identity::{Directory, IdentityError, StaticDirectory, UserProfile};
pub use memory::MemoryStore;

/// Errors raised by a record store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Where a record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Partition {
    /// A shared channel, e.g. the public book catalogue.
    Channel(String),

    /// A user's private inbox.
    Inbox(String),

    /// Replies threaded under another record.
    Thread(String),
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(name) => write!(f, "channel:{}", name),
            Self::Inbox(user) => write!(f, "inbox:{}", user),
            Self::Thread(root) => write!(f, "thread:{}", root),
        }
    }
}

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Store-assigned id.
    pub id: String,

    /// Partition the record was created in.
    pub partition: Partition,

    /// Document body.
    pub content: Value,

    /// Creation time (Unix epoch millis).
    pub created_at: u64,
}

impl Record {
    /// Decode the body as `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.content.clone())?)
    }
}

/// Record store client.
///
/// `get` reports a missing record as [`StoreError::NotFound`] so callers can
/// tell it apart from a failing backend.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record.
    async fn get(&self, id: &str) -> Result<Record, StoreError>;

    /// Create a record in `partition` and return its id.
    async fn create(&self, partition: &Partition, content: Value) -> Result<String, StoreError>;

    /// Replace a record's body.
    async fn update(&self, id: &str, content: Value) -> Result<(), StoreError>;

    /// Delete a record.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Put a deleted record back under its original id.
    async fn restore(&self, record: Record) -> Result<(), StoreError>;

    /// Records in `scope` whose body carries `tag` as a tag entry.
    async fn search_by_tag(&self, tag: &str, scope: &Partition) -> Result<Vec<Record>, StoreError>;
}

/// Render a typed document into the stored form.
pub fn render<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Fresh random record id (128 bits, hex).
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Whether `content` carries `tag` as an element of any array.
pub(crate) fn has_tag(content: &Value, tag: &str) -> bool {
    match content {
        Value::Array(items) => items.iter().any(|item| match item {
            Value::String(s) => s == tag,
            other => has_tag(other, tag),
        }),
        Value::Object(map) => map.values().any(|v| has_tag(v, tag)),
        _ => false,
    }
}
