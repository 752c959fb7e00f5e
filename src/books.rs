//! Book entity manager.
//!
//! Creates, updates and deletes the three records of a book as one unit.
//! Creation and update run through a [`Compensation`] log so a failed call
//! leaves no half-written book behind. Update and delete hold the lock on
//! the public record id for their whole duration.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::compensation::Compensation;
use crate::error::{LendingError, Result, ValidationError};
use crate::lock::{KeyedLock, LockSet};
use crate::model::book::{REL_INVENTORY, REL_PRIVATE, REL_PUBLIC};
use crate::model::{Book, BookInventory, BookPrivate, BookPublic, BookUpload, CopyStatus, Relations};
use crate::node::config::Channels;
use crate::store::{render, Directory, Partition, RecordStore, StoreError};

/// Outcome of one item of an upload batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    Success,
    Error,
}

/// Per-book result of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMessage {
    /// Public record id the item named or created. Empty only when a create
    /// failed.
    pub post_id: String,
    pub status: UploadStatus,
    pub message: String,
}

/// A book as loaded from the store, with the ids and raw content of its
/// parts.
#[derive(Debug, Clone)]
pub(crate) struct StoredBook {
    pub public_id: String,
    pub private_id: String,
    pub inventory_id: String,
    pub book: Book,
    originals: [Value; 3],
}

impl StoredBook {
    /// Write the parts of `next` that render differently from what was
    /// loaded. Returns the number of parts written.
    pub(crate) async fn save(&self, next: &Book, log: &mut Compensation<'_>) -> std::result::Result<usize, StoreError> {
        let parts = [
            (&self.public_id, render(&next.public)?),
            (&self.private_id, render(&next.private)?),
            (&self.inventory_id, render(&next.inventory)?),
        ];

        let mut written = 0;
        for ((id, content), original) in parts.into_iter().zip(self.originals.iter()) {
            if &content == original {
                continue;
            }
            log.update(id, original.clone(), content).await?;
            written += 1;
        }
        Ok(written)
    }
}

/// Manages the book aggregate.
pub struct BookManager {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn KeyedLock>,
    directory: Arc<dyn Directory>,
    channels: Channels,
}

impl BookManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn KeyedLock>,
        directory: Arc<dyn Directory>,
        channels: Channels,
    ) -> Self {
        Self {
            store,
            locks,
            directory,
            channels,
        }
    }

    /// Create a book and return its public record id.
    ///
    /// Listed copies all start in stock.
    pub async fn create(&self, mut book: Book) -> Result<String> {
        if book.public.id.is_empty() {
            return Err(ValidationError::Invalid("book id should not be empty".into()).into());
        }
        if book.inventory.is_negative() {
            return Err(ValidationError::NegativeStock(book.inventory.stock).into());
        }
        for status in book.inventory.copies.values_mut() {
            *status = CopyStatus::InStock;
        }
        check_copy_keepers(&book.private)?;
        self.fill(&mut book).await?;

        let store = self.store.as_ref();
        let mut log = Compensation::new(store);

        match self.write_new(&mut book, &mut log).await {
            Ok(public_id) => {
                log.commit();
                info!(book_id = %book.id(), post_id = %public_id, "Created book");
                Ok(public_id)
            }
            Err(e) => {
                warn!(book_id = %book.id(), error = %e, "Book creation failed, rolling back");
                Err(log.abort(format!("creating book {}", book.id()), e).await)
            }
        }
    }

    async fn write_new(&self, book: &mut Book, log: &mut Compensation<'_>) -> std::result::Result<String, StoreError> {
        let public_id = log
            .create(&self.partition(&self.channels.books_public), render(&BookPublic::default())?)
            .await?;
        let private_id = log
            .create(&self.partition(&self.channels.books_private), render(&BookPrivate::default())?)
            .await?;
        let inventory_id = log
            .create(&self.partition(&self.channels.books_inventory), render(&BookInventory::default())?)
            .await?;

        let relations: Relations = [
            (REL_PUBLIC.to_string(), public_id.clone()),
            (REL_PRIVATE.to_string(), private_id.clone()),
            (REL_INVENTORY.to_string(), inventory_id.clone()),
        ]
        .into_iter()
        .collect();
        book.public.relations = relations.clone();
        book.private.relations = relations.clone();
        book.inventory.relations = relations;

        let empty = Value::Object(Default::default());
        log.update(&public_id, empty.clone(), render(&book.public)?).await?;
        log.update(&private_id, empty.clone(), render(&book.private)?).await?;
        log.update(&inventory_id, empty, render(&book.inventory)?).await?;

        book.upload.post_id = public_id.clone();
        Ok(public_id)
    }

    /// Replace a book's content, keeping fields callers may not set.
    ///
    /// `upload.post_id` names the book. A part left out of the upload keeps
    /// its stored content. Inventory counters other than `stock` are carried
    /// over, and `stock` moves by the explicit `stock_delta` if given,
    /// otherwise by the submitted stock minus the stored total. Tracked
    /// copies keep their state; new ones start in stock.
    pub async fn update(&self, upload: impl Into<BookUpload>) -> Result<String> {
        let upload = upload.into();
        let public_id = upload.upload.post_id.clone();
        let mut guard = LockSet::new(self.locks.clone());
        guard.acquire(&public_id)?;

        let stored = self.load(&public_id).await?;
        let old = &stored.book;
        let mut book = old.clone();

        book.public = upload.public;
        if upload.upload.upd_is_allowed_to_borrow {
            book.public.manually_disallowed = !book.public.is_allowed_to_borrow;
            if book.public.is_allowed_to_borrow {
                book.public.reason_of_disallowed.clear();
            }
        } else {
            book.public.is_allowed_to_borrow = old.public.is_allowed_to_borrow;
            book.public.manually_disallowed = old.public.manually_disallowed;
            book.public.reason_of_disallowed = old.public.reason_of_disallowed.clone();
        }
        book.public.relations = old.public.relations.clone();

        if let Some(mut private) = upload.private {
            private.relations = old.private.relations.clone();
            book.private = private;
        }

        let delta = match (upload.upload.stock_delta, &upload.inventory) {
            (Some(delta), _) => delta,
            (None, Some(inventory)) => inventory.stock - old.inventory.total(),
            (None, None) => 0,
        };
        let stock = old.inventory.stock + delta;
        if stock < 0 {
            return Err(ValidationError::NegativeStock(stock).into());
        }
        book.inventory.stock = stock;
        if let Some(inventory) = &upload.inventory {
            book.inventory.copies = merge_copies(&old.inventory.copies, &inventory.copies)?;
        }

        if stock > 0 && !book.public.manually_disallowed && !book.public.is_allowed_to_borrow {
            book.public.is_allowed_to_borrow = true;
            book.public.reason_of_disallowed.clear();
        }

        check_copy_keepers(&book.private)?;
        self.fill(&mut book).await?;

        let mut log = Compensation::new(self.store.as_ref());
        match stored.save(&book, &mut log).await {
            Ok(written) => {
                log.commit();
                info!(
                    book_id = %book.id(),
                    post_id = %public_id,
                    parts_written = written,
                    stock_delta = delta,
                    "Updated book"
                );
                Ok(public_id)
            }
            Err(e) => {
                warn!(post_id = %public_id, error = %e, "Book update failed, restoring parts");
                Err(log.abort(format!("updating book {}", public_id), e).await)
            }
        }
    }

    /// Delete a book whose copies are all on the shelf.
    ///
    /// Parts go inventory first and public last, so a retry after a partial
    /// delete still finds the book. Already-missing private and inventory
    /// parts are skipped.
    pub async fn delete(&self, public_id: &str) -> Result<()> {
        let mut guard = LockSet::new(self.locks.clone());
        guard.acquire(public_id)?;

        let public: BookPublic = self
            .store
            .get(public_id)
            .await
            .and_then(|r| r.parse())
            .map_err(|e| LendingError::read(format!("loading book {}", public_id), e))?;

        let private_id = public.relations.get(REL_PRIVATE).cloned();
        let inventory_id = public.relations.get(REL_INVENTORY).cloned();

        if let Some(id) = &inventory_id {
            match self.store.get(id).await {
                Ok(record) => {
                    let inventory: BookInventory = record
                        .parse()
                        .map_err(|e| LendingError::read("reading inventory", e))?;
                    if inventory.stock != inventory.total() {
                        return Err(ValidationError::OutstandingCopies {
                            outstanding: inventory.outstanding(),
                        }
                        .into());
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(post_id = %public_id, "Inventory already deleted");
                }
                Err(e) => return Err(LendingError::read("reading inventory", e)),
            }
        }

        for id in [inventory_id.as_deref(), private_id.as_deref()].into_iter().flatten() {
            match self.store.delete(id).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(source) => {
                    return Err(LendingError::Store {
                        context: format!("deleting parts of book {}, retry the delete", public_id),
                        source,
                    })
                }
            }
        }

        self.store
            .delete(public_id)
            .await
            .map_err(|source| LendingError::Store {
                context: format!("deleting book {}, retry the delete", public_id),
                source,
            })?;

        info!(book_id = %public.id, post_id = %public_id, "Deleted book");
        Ok(())
    }

    /// Load the assembled book.
    pub async fn get(&self, public_id: &str) -> Result<Book> {
        Ok(self.load(public_id).await?.book)
    }

    /// The book as `keeper` sees it: the catalogue entry and only the copies
    /// that keeper holds, counted by state.
    pub async fn get_for_keeper(&self, public_id: &str, keeper: &str) -> Result<Book> {
        let book = self.load(public_id).await?.book;
        let name = book.private.keeper_name(keeper).map(str::to_string).ok_or_else(|| {
            ValidationError::Invalid(format!("{} is not a keeper of book {}", keeper, book.id()))
        })?;

        let copy_keepers: BTreeMap<String, String> = book
            .private
            .copy_keepers
            .iter()
            .filter(|(_, held_by)| held_by.as_str() == keeper)
            .map(|(copy, held_by)| (copy.clone(), held_by.clone()))
            .collect();

        let mut inventory = BookInventory {
            id: book.inventory.id.clone(),
            name: book.inventory.name.clone(),
            relations: book.inventory.relations.clone(),
            ..Default::default()
        };
        for (copy, status) in &book.inventory.copies {
            if copy_keepers.contains_key(copy) {
                inventory.copies.insert(copy.clone(), *status);
                *inventory.count_mut(*status) += 1;
            }
        }

        let private = BookPrivate {
            id: book.private.id.clone(),
            name: book.private.name.clone(),
            keeper_users: vec![keeper.to_string()],
            keeper_names: vec![name],
            copy_keepers,
            relations: book.private.relations.clone(),
        };

        Ok(Book {
            public: book.public,
            private,
            inventory,
            upload: book.upload,
        })
    }

    /// Apply a batch of uploads. One item failing never stops the batch.
    ///
    /// Each item is a create when it has no `post_id`, a delete when it has
    /// one and `delete` is set, and an update otherwise. Results are keyed
    /// by catalogue id and echo the item's `post_id`, failed or not.
    pub async fn upload(&self, items: Vec<BookUpload>) -> BTreeMap<String, UploadMessage> {
        let mut results = BTreeMap::new();

        for item in items {
            let key = item.key().to_string();
            let post_id = item.upload.post_id.clone();

            let outcome = if post_id.is_empty() {
                self.create(item.into_book()).await
            } else if item.upload.delete {
                self.delete(&post_id).await.map(|()| post_id.clone())
            } else {
                self.update(item).await
            };

            let message = match outcome {
                Ok(id) => UploadMessage {
                    post_id: id,
                    status: UploadStatus::Success,
                    message: String::new(),
                },
                Err(e) => {
                    warn!(book_id = %key, post_id = %post_id, kind = e.kind().as_str(), error = %e, "Book upload item failed");
                    UploadMessage {
                        post_id,
                        status: UploadStatus::Error,
                        message: e.to_string(),
                    }
                }
            };
            results.insert(key, message);
        }

        results
    }

    /// Load all three parts of a book.
    pub(crate) async fn load(&self, public_id: &str) -> Result<StoredBook> {
        let context = || format!("loading book {}", public_id);

        let public_raw = self
            .store
            .get(public_id)
            .await
            .map_err(|e| LendingError::read(context(), e))?
            .content;
        let public: BookPublic =
            serde_json::from_value(public_raw.clone()).map_err(|e| LendingError::read(context(), e.into()))?;

        let private_id = public
            .relations
            .get(REL_PRIVATE)
            .cloned()
            .ok_or(ValidationError::MissingPart("private"))?;
        let inventory_id = public
            .relations
            .get(REL_INVENTORY)
            .cloned()
            .ok_or(ValidationError::MissingPart("inventory"))?;

        let private_raw = self
            .store
            .get(&private_id)
            .await
            .map_err(|e| LendingError::read(context(), e))?
            .content;
        let inventory_raw = self
            .store
            .get(&inventory_id)
            .await
            .map_err(|e| LendingError::read(context(), e))?
            .content;

        let private: BookPrivate =
            serde_json::from_value(private_raw.clone()).map_err(|e| LendingError::read(context(), e.into()))?;
        let inventory: BookInventory =
            serde_json::from_value(inventory_raw.clone()).map_err(|e| LendingError::read(context(), e.into()))?;

        let book = Book {
            public,
            private,
            inventory,
            upload: crate::model::UploadOptions {
                post_id: public_id.to_string(),
                ..Default::default()
            },
        };

        Ok(StoredBook {
            public_id: public_id.to_string(),
            private_id,
            inventory_id,
            book,
            originals: [public_raw, private_raw, inventory_raw],
        })
    }

    /// Mark a book as out of stock. The caller holds the book's lock.
    pub(crate) async fn disallow_for_stock(&self, stored: &StoredBook) -> Result<()> {
        let mut next = stored.book.clone();
        next.public.disallow_for_stock();

        let mut log = Compensation::new(self.store.as_ref());
        match stored.save(&next, &mut log).await {
            Ok(_) => {
                log.commit();
                info!(post_id = %stored.public_id, "Book flipped to not allowed: no stock");
                Ok(())
            }
            Err(e) => Err(log
                .abort(format!("flagging book {} as out of stock", stored.public_id), e)
                .await),
        }
    }

    /// Fill derived fields: tags, display names and the part names.
    async fn fill(&self, book: &mut Book) -> Result<()> {
        book.public.tags = book.public.derive_tags();
        book.public.libworker_names = self.display_names(&book.public.libworker_users).await?;
        book.private.keeper_names = self.display_names(&book.private.keeper_users).await?;

        book.private.id = book.public.id.clone();
        book.private.name = book.public.name.clone();
        book.inventory.id = book.public.id.clone();
        book.inventory.name = book.public.name.clone();
        Ok(())
    }

    async fn display_names(&self, users: &[String]) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(users.len());
        for user in users {
            let name = self
                .directory
                .display_name(user)
                .await
                .map_err(|e| LendingError::identity(user, e))?;
            names.push(name);
        }
        Ok(names)
    }

    fn partition(&self, channel: &str) -> Partition {
        Partition::Channel(channel.to_string())
    }
}

/// Every copy with a keeper must be held by one of the book's keepers.
fn check_copy_keepers(private: &BookPrivate) -> Result<()> {
    for (copy, keeper) in &private.copy_keepers {
        if !private.keeper_users.contains(keeper) {
            return Err(ValidationError::UnknownCopyKeeper {
                copy: copy.clone(),
                keeper: keeper.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Submitted copy list with each known copy's stored state. A copy that is
/// out of the shelf can not be dropped.
fn merge_copies(
    stored: &BTreeMap<String, CopyStatus>,
    submitted: &BTreeMap<String, CopyStatus>,
) -> Result<BTreeMap<String, CopyStatus>> {
    if let Some((copy, status)) = stored
        .iter()
        .find(|(copy, status)| **status != CopyStatus::InStock && !submitted.contains_key(*copy))
    {
        return Err(ValidationError::CopyInUse {
            copy: copy.clone(),
            status: *status,
        }
        .into());
    }

    Ok(submitted
        .keys()
        .map(|copy| (copy.clone(), stored.get(copy).copied().unwrap_or_default()))
        .collect())
}
