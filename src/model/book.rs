//! Book aggregate.
//!
//! A book is stored as three records: a public catalogue entry, a private
//! custody entry (who keeps the copies) and an inventory counter set. Each
//! part carries [`Relations`] pointing at its siblings.
//!
//! Individual copies are optional. A book that lists copies tracks where
//! each one is and which keeper holds it; a book without them is counted
//! only.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::tags::{self, tag};

/// Relation kind -> record id.
pub type Relations = BTreeMap<String, String>;

pub const REL_PUBLIC: &str = "public";
pub const REL_PRIVATE: &str = "private";
pub const REL_INVENTORY: &str = "inventory";

/// Catalogue entry, visible to everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookPublic {
    /// Catalogue id.
    pub id: String,
    pub name: String,
    pub name_en: String,
    pub category1: String,
    pub category2: String,
    pub category3: String,
    pub author: String,
    pub author_en: String,
    pub translator: String,
    pub translator_en: String,
    pub publisher: String,
    pub publisher_en: String,
    pub publish_date: String,
    pub introduction: String,
    pub book_index: String,

    /// Library workers who may coordinate loans of this book.
    pub libworker_users: Vec<String>,

    /// Derived from `libworker_users`.
    pub libworker_names: Vec<String>,

    /// Derived search tags.
    pub tags: Vec<String>,

    pub is_allowed_to_borrow: bool,

    /// Set when borrowing was switched off by hand rather than by stock.
    pub manually_disallowed: bool,

    pub reason_of_disallowed: String,

    pub relations: Relations,
}

impl BookPublic {
    /// Catalogue tags: id and each non-empty category.
    pub fn derive_tags(&self) -> Vec<String> {
        let mut derived = vec![tag(tags::ID, &self.id)];
        for (prefix, value) in [
            (tags::CATEGORY1, &self.category1),
            (tags::CATEGORY2, &self.category2),
            (tags::CATEGORY3, &self.category3),
        ] {
            if !value.is_empty() {
                derived.push(tag(prefix, value));
            }
        }
        derived
    }

    /// Re-enable borrowing once stock is back, unless switched off by hand.
    pub fn reconcile_stock(&mut self, stock: i64) {
        if stock > 0 && !self.is_allowed_to_borrow && !self.manually_disallowed {
            self.is_allowed_to_borrow = true;
            self.reason_of_disallowed.clear();
        }
        if stock <= 0 && self.is_allowed_to_borrow {
            self.disallow_for_stock();
        }
    }

    pub fn disallow_for_stock(&mut self) {
        self.is_allowed_to_borrow = false;
        self.reason_of_disallowed = NO_STOCK_REASON.to_string();
    }
}

/// Reason recorded when a book runs out of stock.
pub const NO_STOCK_REASON: &str = "no-stock";

/// Custody entry: who physically keeps the copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookPrivate {
    pub id: String,
    pub name: String,
    pub keeper_users: Vec<String>,
    pub keeper_names: Vec<String>,

    /// Copy id -> keeper holding it.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub copy_keepers: BTreeMap<String, String>,

    pub relations: Relations,
}

impl BookPrivate {
    /// Display name of `keeper`, if listed.
    pub fn keeper_name(&self, keeper: &str) -> Option<&str> {
        self.keeper_users
            .iter()
            .position(|k| k == keeper)
            .and_then(|i| self.keeper_names.get(i))
            .map(String::as_str)
    }
}

/// Where a copy is. Each state has a counter in [`BookInventory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyStatus {
    #[default]
    InStock,
    TransmitOut,
    Lending,
    TransmitIn,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InStock => "IN_STOCK",
            Self::TransmitOut => "TRANSMIT_OUT",
            Self::Lending => "LENDING",
            Self::TransmitIn => "TRANSMIT_IN",
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookInventory {
    pub id: String,
    pub name: String,

    /// On the shelf.
    pub stock: i64,

    /// On the way from a keeper to a borrower.
    pub transmit_out: i64,

    /// With a borrower.
    pub lending: i64,

    /// On the way back.
    pub transmit_in: i64,

    /// Copy id -> where it is. Empty when copies are not tracked.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub copies: BTreeMap<String, CopyStatus>,

    pub relations: Relations,
}

impl BookInventory {
    /// Total copy count.
    pub fn total(&self) -> i64 {
        self.stock + self.transmit_out + self.lending + self.transmit_in
    }

    /// Copies not on the shelf.
    pub fn outstanding(&self) -> i64 {
        self.total() - self.stock
    }

    pub fn is_negative(&self) -> bool {
        self.stock < 0 || self.transmit_out < 0 || self.lending < 0 || self.transmit_in < 0
    }

    /// Whether individual copies are tracked.
    pub fn tracks_copies(&self) -> bool {
        !self.copies.is_empty()
    }

    /// Counter holding copies in `status`.
    pub fn count_mut(&mut self, status: CopyStatus) -> &mut i64 {
        match status {
            CopyStatus::InStock => &mut self.stock,
            CopyStatus::TransmitOut => &mut self.transmit_out,
            CopyStatus::Lending => &mut self.lending,
            CopyStatus::TransmitIn => &mut self.transmit_in,
        }
    }
}

/// Per-item options of a book upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadOptions {
    /// Public record id of an existing book. Empty for a new book.
    pub post_id: String,

    /// Delete the book identified by `post_id`.
    pub delete: bool,

    /// Apply the submitted `is_allowed_to_borrow` instead of keeping the
    /// stored one.
    pub upd_is_allowed_to_borrow: bool,

    /// Signed stock change. Takes precedence over the change inferred from
    /// the submitted stock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_delta: Option<i64>,
}

/// The assembled book as stored or returned by a lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub public: BookPublic,

    #[serde(default)]
    pub private: BookPrivate,

    #[serde(default)]
    pub inventory: BookInventory,

    #[serde(default)]
    pub upload: UploadOptions,
}

impl Book {
    /// Catalogue id.
    pub fn id(&self) -> &str {
        &self.public.id
    }
}

/// One item of an upload batch.
///
/// A part left out of an update keeps its stored content. A create treats
/// a missing part as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpload {
    pub public: BookPublic,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<BookPrivate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<BookInventory>,

    #[serde(default)]
    pub upload: UploadOptions,
}

impl BookUpload {
    /// The book to create from this item. Missing parts are empty.
    pub fn into_book(self) -> Book {
        Book {
            public: self.public,
            private: self.private.unwrap_or_default(),
            inventory: self.inventory.unwrap_or_default(),
            upload: self.upload,
        }
    }

    /// Catalogue id, or the post id when the catalogue id is missing.
    pub fn key(&self) -> &str {
        if self.public.id.is_empty() {
            &self.upload.post_id
        } else {
            &self.public.id
        }
    }
}

impl From<Book> for BookUpload {
    fn from(book: Book) -> Self {
        Self {
            public: book.public,
            private: Some(book.private),
            inventory: Some(book.inventory),
            upload: book.upload,
        }
    }
}
