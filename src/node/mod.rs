//! Lending node.
//!
//! Wires one record store, one lock registry and one user directory into
//! the book manager, the borrow engine and the workflow engine. Every
//! component shares the same lock registry, so a book or loan locked by one
//! operation is busy for all the others.

pub mod config;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::books::BookManager;
use crate::borrow::BorrowEngine;
use crate::lock::{KeyedLock, LocalLocks};
use crate::model::now_millis;
use crate::store::{Directory, MemoryStore, RecordStore, StaticDirectory, StoreError};
use crate::workflow::WorkflowEngine;

pub use config::{Channels, ConfigError, NodeConfig};

/// Errors that can occur starting a node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Lending rules exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LendingRules {
    pub max_renew_times: u32,
    pub expired_days: u32,
    pub borrow_limit: u32,
}

/// One lending node.
pub struct LendingNode {
    config: NodeConfig,
    books: Arc<BookManager>,
    borrows: BorrowEngine,
    workflow: WorkflowEngine,
    started_at: u64,
}

impl LendingNode {
    /// Create a node over the built-in store and the configured users.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let store = if config.ephemeral {
            MemoryStore::new()
        } else {
            MemoryStore::open(&config.data_dir)?
        };
        let directory = StaticDirectory::from_profiles(config.users.clone());

        Ok(Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(LocalLocks::new()),
            Arc::new(directory),
        ))
    }

    /// Create a node over caller-supplied backends.
    pub fn with_parts(
        config: NodeConfig,
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn KeyedLock>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let books = Arc::new(BookManager::new(
            store.clone(),
            locks.clone(),
            directory.clone(),
            config.channels.clone(),
        ));
        let borrows = BorrowEngine::new(
            store.clone(),
            locks.clone(),
            directory,
            books.clone(),
            config.channels.borrow_workflow.clone(),
            config.borrow_limit,
        );
        let workflow = WorkflowEngine::new(store, locks, books.clone(), config.max_renew_times);

        info!(
            data_dir = %config.data_dir.display(),
            ephemeral = config.ephemeral,
            borrow_limit = config.borrow_limit,
            max_renew_times = config.max_renew_times,
            "Lending node initialized"
        );

        Self {
            config,
            books,
            borrows,
            workflow,
            started_at: now_millis(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn rules(&self) -> LendingRules {
        LendingRules {
            max_renew_times: self.config.max_renew_times,
            expired_days: self.config.expired_days,
            borrow_limit: self.config.borrow_limit,
        }
    }

    pub fn books(&self) -> &BookManager {
        &self.books
    }

    pub fn borrows(&self) -> &BorrowEngine {
        &self.borrows
    }

    pub fn workflow(&self) -> &WorkflowEngine {
        &self.workflow
    }

    /// Node start time (Unix epoch millis).
    pub fn started_at(&self) -> u64 {
        self.started_at
    }
}
