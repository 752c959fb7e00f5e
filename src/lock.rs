//! Keyed lock service.
//!
//! A process-wide registry of exclusive locks keyed by record id. Acquisition
//! never waits: a second caller for the same id is told the lock is held and
//! must treat that as "busy, retry later".
//!
//! Top-level operations collect their locks in a [`LockSet`], which releases
//! every id it took when dropped, whatever the exit path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::LendingError;

/// Non-blocking exclusive lock by id.
///
/// The in-process [`LocalLocks`] is the default. Anything that honours the
/// same fail-fast contract (a distributed lease, for example) can be swapped in.
pub trait KeyedLock: Send + Sync {
    /// Take the lock for `id`. Returns `false` if someone already holds it.
    fn try_acquire(&self, id: &str) -> bool;

    /// Release the lock for `id`. Releasing a free id is a no-op.
    fn release(&self, id: &str);
}

/// In-memory lock registry shared by every component of one process.
#[derive(Debug, Default)]
pub struct LocalLocks {
    held: Mutex<HashSet<String>>,
}

impl LocalLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently locked.
    pub fn is_held(&self, id: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(id))
            .unwrap_or(false)
    }
}

impl KeyedLock for LocalLocks {
    fn try_acquire(&self, id: &str) -> bool {
        match self.held.lock() {
            Ok(mut held) => held.insert(id.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(id.to_string()),
        }
    }

    fn release(&self, id: &str) {
        match self.held.lock() {
            Ok(mut held) => {
                held.remove(id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(id);
            }
        }
    }
}

/// Locks held by one top-level operation.
///
/// Taking an id this set already holds is a no-op, so a participant who holds
/// several roles (and therefore shares one document id) is locked once.
pub struct LockSet {
    locks: Arc<dyn KeyedLock>,
    held: Vec<String>,
}

impl LockSet {
    /// Start an empty set against `locks`.
    pub fn new(locks: Arc<dyn KeyedLock>) -> Self {
        Self {
            locks,
            held: Vec::new(),
        }
    }

    /// Lock `id`, failing with [`LendingError::LockConflict`] if another
    /// operation holds it.
    pub fn acquire(&mut self, id: &str) -> Result<(), LendingError> {
        if self.holds(id) {
            return Ok(());
        }

        if !self.locks.try_acquire(id) {
            debug!(record_id = %id, "Lock busy");
            return Err(LendingError::LockConflict(id.to_string()));
        }

        self.held.push(id.to_string());
        Ok(())
    }

    /// Lock every id in `ids`, stopping at the first conflict.
    ///
    /// Ids taken before the conflict stay in the set and are released on drop.
    pub fn acquire_all<'a, I>(&mut self, ids: I) -> Result<(), LendingError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for id in ids {
            self.acquire(id)?;
        }
        Ok(())
    }

    /// Whether this set holds `id`.
    pub fn holds(&self, id: &str) -> bool {
        self.held.iter().any(|held| held == id)
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for id in self.held.drain(..) {
            self.locks.release(&id);
        }
    }
}
