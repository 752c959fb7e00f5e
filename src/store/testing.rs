//! Fault-injecting store for rollback tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{MemoryStore, Partition, Record, RecordStore, StoreError};

#[derive(Debug, Default)]
struct Faults {
    /// Partition -> (creates seen since armed, create number that fails).
    create_in: HashMap<Partition, (usize, usize)>,
    update_of: HashSet<String>,
    updates_in: HashSet<Partition>,
    delete_of: HashSet<String>,
    deletes_in: HashSet<Partition>,
    /// (writes seen since armed, write number that fails).
    nth_write: Option<(usize, usize)>,
    writes: usize,
    ops: Vec<String>,
}

/// [`MemoryStore`] wrapper that fails chosen writes.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the `nth` (1-based) create into `partition` from now on.
    pub fn fail_nth_create_in(&self, partition: Partition, nth: usize) {
        self.faults().create_in.insert(partition, (0, nth));
    }

    pub fn fail_update_of(&self, id: &str) {
        self.faults().update_of.insert(id.to_string());
    }

    pub fn fail_updates_in(&self, partition: Partition) {
        self.faults().updates_in.insert(partition);
    }

    pub fn fail_delete_of(&self, id: &str) {
        self.faults().delete_of.insert(id.to_string());
    }

    pub fn fail_deletes_in(&self, partition: Partition) {
        self.faults().deletes_in.insert(partition);
    }

    /// Fail the `nth` (1-based) write of any kind from now on.
    pub fn fail_nth_write(&self, nth: usize) {
        self.faults().nth_write = Some((0, nth));
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults();
        faults.create_in.clear();
        faults.update_of.clear();
        faults.updates_in.clear();
        faults.delete_of.clear();
        faults.deletes_in.clear();
        faults.nth_write = None;
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.faults().writes
    }

    /// Successful writes, oldest first, as `create:<partition>`,
    /// `update:<id>`, `delete:<id>` or `restore:<id>`.
    pub fn ops(&self) -> Vec<String> {
        self.faults().ops.clone()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn trip_nth_write(faults: &mut Faults) -> bool {
        match &mut faults.nth_write {
            Some((seen, nth)) => {
                *seen += 1;
                *seen == *nth
            }
            None => false,
        }
    }

    fn record(&self, op: String) {
        let mut faults = self.faults();
        faults.writes += 1;
        faults.ops.push(op);
    }

    fn injected(what: &str) -> StoreError {
        StoreError::Backend(format!("injected failure: {}", what))
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        self.inner.get(id).await
    }

    async fn create(&self, partition: &Partition, content: Value) -> Result<String, StoreError> {
        {
            let mut faults = self.faults();
            let tripped = match faults.create_in.get_mut(partition) {
                Some((seen, nth)) => {
                    *seen += 1;
                    *seen == *nth
                }
                None => false,
            };
            if Self::trip_nth_write(&mut faults) || tripped {
                return Err(Self::injected(&format!("create in {}", partition)));
            }
        }

        let id = self.inner.create(partition, content).await?;
        self.record(format!("create:{}", partition));
        Ok(id)
    }

    async fn update(&self, id: &str, content: Value) -> Result<(), StoreError> {
        {
            let partition = self.inner.get(id).await.ok().map(|r| r.partition);
            let mut faults = self.faults();
            let blocked = faults.update_of.contains(id)
                || partition.is_some_and(|p| faults.updates_in.contains(&p));
            if Self::trip_nth_write(&mut faults) || blocked {
                return Err(Self::injected(&format!("update of {}", id)));
            }
        }

        self.inner.update(id, content).await?;
        self.record(format!("update:{}", id));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        {
            let partition = self.inner.get(id).await.ok().map(|r| r.partition);
            let mut faults = self.faults();
            let blocked = faults.delete_of.contains(id)
                || partition.is_some_and(|p| faults.deletes_in.contains(&p));
            if Self::trip_nth_write(&mut faults) || blocked {
                return Err(Self::injected(&format!("delete of {}", id)));
            }
        }

        self.inner.delete(id).await?;
        self.record(format!("delete:{}", id));
        Ok(())
    }

    async fn restore(&self, record: Record) -> Result<(), StoreError> {
        {
            let mut faults = self.faults();
            if Self::trip_nth_write(&mut faults) {
                return Err(Self::injected(&format!("restore of {}", record.id)));
            }
        }

        let id = record.id.clone();
        self.inner.restore(record).await?;
        self.record(format!("restore:{}", id));
        Ok(())
    }

    async fn search_by_tag(&self, tag: &str, scope: &Partition) -> Result<Vec<Record>, StoreError> {
        self.inner.search_by_tag(tag, scope).await
    }
}
