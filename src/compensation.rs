//! Compensation log for multi-record writes.
//!
//! The record store has no transactions. Operations that write several
//! records go through a [`Compensation`] log: each write records its inverse,
//! and on failure the log is unwound newest-first so the store ends up as it
//! was before the call.

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::LendingError;
use crate::store::{Partition, Record, RecordStore, StoreError};

/// Inverse of one write.
#[derive(Debug, Clone, PartialEq)]
enum Undo {
    /// Remove a record created in this call.
    Delete { id: String },

    /// Put back the content a record had before this call.
    Restore { id: String, content: Value },

    /// Put back a record deleted in this call.
    Recreate { record: Record },
}

/// Operation-local stack of inverse actions.
pub struct Compensation<'a> {
    store: &'a dyn RecordStore,
    undo: Vec<Undo>,
}

impl<'a> Compensation<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self {
            store,
            undo: Vec::new(),
        }
    }

    /// Create a record and remember to delete it on unwind.
    pub async fn create(&mut self, partition: &Partition, content: Value) -> Result<String, StoreError> {
        let id = self.store.create(partition, content).await?;
        self.undo.push(Undo::Delete { id: id.clone() });
        Ok(id)
    }

    /// Overwrite a record and remember its `previous` content.
    ///
    /// Only the first update of an id is recorded, and records created by
    /// this log are never restored (deleting them is enough).
    pub async fn update(&mut self, id: &str, previous: Value, content: Value) -> Result<(), StoreError> {
        self.store.update(id, content).await?;

        if !self.touches(id) {
            self.undo.push(Undo::Restore {
                id: id.to_string(),
                content: previous,
            });
        }
        Ok(())
    }

    /// Delete a loaded record and remember it so unwind can put it back
    /// under the same id.
    pub async fn delete(&mut self, record: Record) -> Result<(), StoreError> {
        self.store.delete(&record.id).await?;
        self.undo.push(Undo::Recreate { record });
        Ok(())
    }

    /// Number of recorded inverse actions.
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    /// Drop the log after a successful operation.
    pub fn commit(self) {
        debug!(writes = self.undo.len(), "Committed compensation log");
    }

    /// Undo what was written and classify the failure that stopped the
    /// operation.
    ///
    /// With nothing written yet the failure is a plain store error.
    /// Otherwise it is a partial write, or a fatal inconsistency if the
    /// unwind fails too.
    pub async fn abort(self, context: impl Into<String>, source: StoreError) -> LendingError {
        if self.undo.is_empty() {
            return LendingError::Store {
                context: context.into(),
                source,
            };
        }
        let rollback = self.unwind().await;
        LendingError::after_rollback(context, source, rollback)
    }

    /// Undo everything, newest first.
    ///
    /// Best effort: every inverse action is attempted even after one fails.
    /// Returns the first failure, which the caller must surface as a fatal
    /// inconsistency.
    pub async fn unwind(self) -> Result<(), StoreError> {
        let mut first_err = None;

        for undo in self.undo.into_iter().rev() {
            let result = match &undo {
                Undo::Delete { id } => match self.store.delete(id).await {
                    Err(StoreError::NotFound(_)) => Ok(()),
                    other => other,
                },
                Undo::Restore { id, content } => self.store.update(id, content.clone()).await,
                Undo::Recreate { record } => self.store.restore(record.clone()).await,
            };

            match result {
                Ok(()) => debug!(?undo, "Compensated write"),
                Err(e) => {
                    error!(?undo, error = %e, "Compensation failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => {
                warn!("Rollback incomplete, records need manual repair");
                Err(e)
            }
        }
    }

    fn touches(&self, id: &str) -> bool {
        self.undo.iter().any(|u| match u {
            Undo::Delete { id: held } | Undo::Restore { id: held, .. } => held == id,
            Undo::Recreate { record } => record.id == id,
        })
    }
}
