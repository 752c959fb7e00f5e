//! Shared fixtures for engine tests.

use std::sync::Arc;

use crate::books::BookManager;
use crate::borrow::{BorrowEngine, WorkerSelector};
use crate::lock::LocalLocks;
use crate::model::{Book, BookInventory, BookPrivate, BookPublic, CopyStatus};
use crate::node::config::{Channels, NodeConfig};
use crate::store::testing::FaultyStore;
use crate::store::{Partition, StaticDirectory, UserProfile};
use crate::workflow::WorkflowEngine;

/// Always picks the first listed worker.
pub struct FirstWorker;

impl WorkerSelector for FirstWorker {
    fn select(&self, workers: &[String]) -> Option<String> {
        workers.first().cloned()
    }
}

/// Store, locks and directory shared by the engines under test.
pub struct Harness {
    pub store: Arc<FaultyStore>,
    pub locks: Arc<LocalLocks>,
    pub directory: Arc<StaticDirectory>,
    pub channels: Channels,
}

/// Users every fixture knows. `nolast` has no family name.
pub fn users() -> Vec<UserProfile> {
    vec![
        UserProfile::new("bor", "rower", "B"),
        UserProfile::new("bor2", "rower2", "B"),
        UserProfile::new("wk1", "orker1", "W"),
        UserProfile::new("wk2", "orker2", "W"),
        UserProfile::new("kp1", "eeper1", "K"),
        UserProfile::new("kp2", "eeper2", "K"),
        UserProfile::new("nolast", "only", ""),
    ]
}

/// In-memory node config knowing [`users`].
pub fn node_config() -> NodeConfig {
    users()
        .into_iter()
        .fold(NodeConfig::default().ephemeral(), NodeConfig::with_user)
}

impl Harness {
    pub fn new() -> Self {
        let directory = StaticDirectory::from_profiles(users());

        Self {
            store: Arc::new(FaultyStore::new()),
            locks: Arc::new(LocalLocks::new()),
            directory: Arc::new(directory),
            channels: Channels::default(),
        }
    }

    pub fn books(&self) -> BookManager {
        BookManager::new(
            self.store.clone(),
            self.locks.clone(),
            self.directory.clone(),
            self.channels.clone(),
        )
    }

    pub fn borrow(&self, borrow_limit: u32) -> BorrowEngine {
        BorrowEngine::new(
            self.store.clone(),
            self.locks.clone(),
            self.directory.clone(),
            Arc::new(self.books()),
            self.channels.borrow_workflow.clone(),
            borrow_limit,
        )
        .with_selector(Arc::new(FirstWorker))
    }

    pub fn workflow_engine(&self, max_renew_times: u32) -> WorkflowEngine {
        WorkflowEngine::new(
            self.store.clone(),
            self.locks.clone(),
            Arc::new(self.books()),
            max_renew_times,
        )
    }

    pub fn public(&self) -> Partition {
        Partition::Channel(self.channels.books_public.clone())
    }

    pub fn private(&self) -> Partition {
        Partition::Channel(self.channels.books_private.clone())
    }

    pub fn inventory(&self) -> Partition {
        Partition::Channel(self.channels.books_inventory.clone())
    }

    pub fn workflow(&self) -> Partition {
        Partition::Channel(self.channels.borrow_workflow.clone())
    }
}

/// A borrowable book with one library worker and two keepers.
pub fn sample_book(id: &str, stock: i64) -> Book {
    Book {
        public: BookPublic {
            id: id.to_string(),
            name: format!("name-{}", id),
            category1: "c1".into(),
            author: "author".into(),
            libworker_users: vec!["wk1".into()],
            is_allowed_to_borrow: true,
            ..Default::default()
        },
        private: BookPrivate {
            keeper_users: vec!["kp1".into(), "kp2".into()],
            ..Default::default()
        },
        inventory: BookInventory {
            stock,
            ..Default::default()
        },
        upload: Default::default(),
    }
}

/// [`sample_book`] with two tracked copies: `cp1` held by `kp1` and `cp2`
/// held by `kp2`.
pub fn tracked_book(id: &str) -> Book {
    let mut book = sample_book(id, 2);
    for (copy, keeper) in [("cp1", "kp1"), ("cp2", "kp2")] {
        book.private.copy_keepers.insert(copy.into(), keeper.into());
        book.inventory.copies.insert(copy.into(), CopyStatus::InStock);
    }
    book
}
