//! Borrow fan-out engine.
//!
//! Starting a loan writes the full MASTER copy of the request into the
//! shared workflow channel and one copy into each participant's inbox, cut
//! down to what that participant may see, then links them both ways. Everything written in the call is rolled back if any step
//! fails.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::books::{BookManager, StoredBook};
use crate::compensation::Compensation;
use crate::error::{LendingError, Result, ValidationError};
use crate::lock::{KeyedLock, LockSet};
use crate::model::tags::{self, tag};
use crate::model::workflow::template;
use crate::model::{now_millis, Borrow, BorrowRequest, Dates, RelationKeys, Role};
use crate::store::{new_id, render, Directory, Partition, RecordStore, StoreError};

/// Picks the library worker who handles a loan.
pub trait WorkerSelector: Send + Sync {
    fn select(&self, workers: &[String]) -> Option<String>;
}

/// Uniformly random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformSelector;

impl WorkerSelector for UniformSelector {
    fn select(&self, workers: &[String]) -> Option<String> {
        workers.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Who the new loan's documents went to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedBorrow {
    pub master_id: String,
    pub match_id: String,
    pub libworker_user: String,

    /// `(recipient, document id)` for every satellite.
    pub satellites: Vec<(String, String)>,
}

/// Starts loans.
pub struct BorrowEngine {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn KeyedLock>,
    directory: Arc<dyn Directory>,
    books: Arc<BookManager>,
    selector: Arc<dyn WorkerSelector>,
    workflow_channel: String,
    borrow_limit: u32,
}

impl BorrowEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn KeyedLock>,
        directory: Arc<dyn Directory>,
        books: Arc<BookManager>,
        workflow_channel: impl Into<String>,
        borrow_limit: u32,
    ) -> Self {
        Self {
            store,
            locks,
            directory,
            books,
            selector: Arc::new(UniformSelector),
            workflow_channel: workflow_channel.into(),
            borrow_limit,
        }
    }

    /// Replace the worker selection strategy.
    pub fn with_selector(mut self, selector: Arc<dyn WorkerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Start a loan of `book_post_id` for `borrower`.
    pub async fn start(&self, book_post_id: &str, borrower: &str) -> Result<StartedBorrow> {
        let mut guard = LockSet::new(self.locks.clone());
        guard.acquire(book_post_id)?;

        let stored = self.books.load(book_post_id).await?;
        self.admit(&stored, borrower).await?;

        let request = self.build_request(&stored, borrower).await?;

        let mut log = Compensation::new(self.store.as_ref());
        match self.persist(&request, &mut log).await {
            Ok(started) => {
                log.commit();
                info!(
                    book_id = %request.book_id,
                    master_id = %started.master_id,
                    borrower = %borrower,
                    libworker = %request.libworker_user,
                    documents = started.satellites.len() + 1,
                    "Started borrow request"
                );
                Ok(started)
            }
            Err(e) => {
                warn!(book_id = %request.book_id, borrower = %borrower, error = %e, "Borrow fan-out failed, rolling back");
                Err(log
                    .abort(format!("starting borrow of {} for {}", request.book_id, borrower), e)
                    .await)
            }
        }
    }

    /// Checks run before anything is written.
    async fn admit(&self, stored: &StoredBook, borrower: &str) -> Result<()> {
        let public = &stored.book.public;

        if public.manually_disallowed && !public.is_allowed_to_borrow {
            return Err(ValidationError::NotAllowedToBorrow(public.reason_of_disallowed.clone()).into());
        }

        if stored.book.inventory.stock <= 0 {
            if public.is_allowed_to_borrow {
                self.books.disallow_for_stock(stored).await?;
            }
            return Err(ValidationError::NoStock.into());
        }

        if self.borrow_limit > 0 {
            let active = self.active_loans(borrower).await?;
            if active >= self.borrow_limit as usize {
                return Err(ValidationError::BorrowingLimited {
                    active,
                    limit: self.borrow_limit,
                }
                .into());
            }
        }

        Ok(())
    }

    /// MASTER documents of `borrower` that have not reached a terminal status.
    pub async fn active_loans(&self, borrower: &str) -> Result<usize> {
        let records = self
            .store
            .search_by_tag(&tag(tags::BORROWER, borrower), &self.workflow_partition())
            .await
            .map_err(|e| LendingError::read(format!("counting loans of {}", borrower), e))?;

        let mut active = 0;
        for record in records {
            let borrow: Borrow = match record.parse() {
                Ok(borrow) => borrow,
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Skipping unreadable workflow document");
                    continue;
                }
            };
            let live = borrow.request.status().is_some_and(|s| !s.is_terminal());
            if borrow.is_master() && borrow.request.borrower_user == borrower && live {
                active += 1;
            }
        }

        debug!(borrower = %borrower, active, "Counted active loans");
        Ok(active)
    }

    async fn build_request(&self, stored: &StoredBook, borrower: &str) -> Result<BorrowRequest> {
        let book = &stored.book;

        let libworker = self
            .selector
            .select(&book.public.libworker_users)
            .ok_or(ValidationError::NoLibworker)?;

        let borrower_name = self.display_name(borrower).await?;
        let libworker_name = self.display_name(&libworker).await?;

        let now = now_millis();
        let mut request = BorrowRequest {
            book_post_id: stored.public_id.clone(),
            book_id: book.public.id.clone(),
            book_name: book.public.name.clone(),
            author: book.public.author.clone(),
            borrower_user: borrower.to_string(),
            borrower_name,
            libworker_user: libworker,
            libworker_name,
            keeper_users: book.private.keeper_users.clone(),
            keeper_names: book.private.keeper_names.clone(),
            tags: Vec::new(),
            workflow: template(now),
            step_index: 0,
            last_step_index: 0,
            renewed_times: 0,
            chosen_copy_id: None,
            match_id: new_id(),
            dates: Dates {
                request: now,
                ..Default::default()
            },
        };
        request.retag();
        Ok(request)
    }

    /// Create and link every document of a new loan.
    async fn persist(
        &self,
        request: &BorrowRequest,
        log: &mut Compensation<'_>,
    ) -> std::result::Result<StartedBorrow, StoreError> {
        let book_keys = RelationKeys {
            book: request.book_post_id.clone(),
            ..Default::default()
        };

        let mut master = Borrow {
            request: request.clone(),
            roles: vec![Role::Master],
            relation_keys: book_keys.clone(),
        };
        let master_id = log.create(&self.workflow_partition(), render(&master)?).await?;

        let mut satellites = Vec::new();
        for (user, roles) in request.recipients() {
            let doc = Borrow {
                request: request.view_for(&roles),
                roles: roles.clone(),
                relation_keys: book_keys.clone(),
            };
            let id = log.create(&Partition::Inbox(user.clone()), render(&doc)?).await?;
            satellites.push((user, roles, doc, id));
        }

        let previous = render(&master)?;
        for (_, roles, _, id) in &satellites {
            master.relation_keys.link(id, roles);
        }
        log.update(&master_id, previous, render(&master)?).await?;

        for (_, _, doc, id) in &mut satellites {
            let previous = render(&*doc)?;
            doc.relation_keys.master = Some(master_id.clone());
            log.update(id, previous, render(&*doc)?).await?;
        }

        Ok(StartedBorrow {
            master_id,
            match_id: request.match_id.clone(),
            libworker_user: request.libworker_user.clone(),
            satellites: satellites
                .into_iter()
                .map(|(user, _, _, id)| (user, id))
                .collect(),
        })
    }

    async fn display_name(&self, user: &str) -> Result<String> {
        self.directory
            .display_name(user)
            .await
            .map_err(|e| LendingError::identity(user, e))
    }

    fn workflow_partition(&self) -> Partition {
        Partition::Channel(self.workflow_channel.clone())
    }
}
