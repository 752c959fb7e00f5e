//! In-process record store.
//!
//! Keeps every record in memory and, when opened on a data directory, mirrors
//! the full record set to `records.json` after each write. A write whose
//! snapshot cannot be flushed is not applied.
//!
//! Snapshot files are written with `tokio::fs` while only the async writer
//! lock is held; the in-memory state lock is never held across I/O.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use serde_json::Value;
use tracing::{debug, info};

use super::{has_tag, new_id, Partition, Record, RecordStore, StoreError};
use crate::model::now_millis;

const SNAPSHOT_FILE: &str = "records.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    records: BTreeMap<String, Record>,
}

/// Record store held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Snapshot>,
    /// Serializes snapshot flushes so they land in write order.
    writer: AsyncMutex<()>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Empty, non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted under `data_dir`, loading any existing snapshot.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SNAPSHOT_FILE);

        let snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Snapshot::default()
        };

        info!(
            path = %path.display(),
            records = snapshot.records.len(),
            "Opened record store"
        );

        Ok(Self {
            state: Mutex::new(snapshot),
            writer: AsyncMutex::new(()),
            snapshot_path: Some(path),
        })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a record with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.lock()
            .map(|s| s.records.contains_key(id))
            .unwrap_or(false)
    }

    /// All records in `partition`, oldest first.
    pub fn records_in(&self, partition: &Partition) -> Vec<Record> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut records: Vec<Record> = state
            .records
            .values()
            .filter(|r| &r.partition == partition)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    fn lock(&self) -> Result<MutexGuard<'_, Snapshot>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Backend(format!("store state poisoned: {}", e)))
    }

    /// Apply `change` to a copy of the state, flush it, then swap it in.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let Some(path) = &self.snapshot_path else {
            let mut state = self.lock()?;
            return change(&mut *state);
        };

        let _writer = self.writer.lock().await;
        let mut next = self.lock()?.clone();
        let value = change(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        *self.lock()? = next;
        Ok(value)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        self.lock()?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create(&self, partition: &Partition, content: Value) -> Result<String, StoreError> {
        let id = new_id();
        let record = Record {
            id: id.clone(),
            partition: partition.clone(),
            content,
            created_at: now_millis(),
        };

        self.commit(|state| {
            state.records.insert(id.clone(), record);
            Ok(())
        })
        .await?;

        debug!(record_id = %id, partition = %partition, "Created record");
        Ok(id)
    }

    async fn update(&self, id: &str, content: Value) -> Result<(), StoreError> {
        self.commit(|state| {
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            record.content = content;
            Ok(())
        })
        .await?;

        debug!(record_id = %id, "Updated record");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.commit(|state| {
            state
                .records
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
        .await?;

        debug!(record_id = %id, "Deleted record");
        Ok(())
    }

    async fn restore(&self, record: Record) -> Result<(), StoreError> {
        let id = record.id.clone();
        self.commit(|state| {
            state.records.insert(record.id.clone(), record);
            Ok(())
        })
        .await?;

        debug!(record_id = %id, "Restored record");
        Ok(())
    }

    async fn search_by_tag(&self, tag: &str, scope: &Partition) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records_in(scope)
            .into_iter()
            .filter(|r| has_tag(&r.content, tag))
            .collect())
    }
}
