//! Error taxonomy for lending operations.
//!
//! Store and identity failures never reach callers raw: each operation wraps
//! them with context and folds them into one of the kinds below.

use thiserror::Error;

use crate::model::CopyStatus;
use crate::store::identity::IdentityError;
use crate::store::StoreError;

/// Broad class of a [`LendingError`], used by the API to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    LockConflict,
    Validation,
    Store,
    PartialWriteFailure,
    FatalInconsistency,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::LockConflict => "lock_conflict",
            Self::Validation => "validation",
            Self::Store => "store",
            Self::PartialWriteFailure => "partial_write_failure",
            Self::FatalInconsistency => "fatal_inconsistency",
        }
    }
}

/// Request was understood but breaks a lending rule.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("stock can not be negative (would be {0})")]
    NegativeStock(i64),

    #[error("all copies should be returned before deletion ({outstanding} still out)")]
    OutstandingCopies { outstanding: i64 },

    #[error("unknown status {status} in workflow {workflow}")]
    UnknownTransition { workflow: String, status: String },

    #[error("status {to} can not follow {from}")]
    InvalidTransition { from: String, to: String },

    #[error("borrowing limit reached: {active} active loans, limit is {limit}")]
    BorrowingLimited { active: usize, limit: u32 },

    #[error("no-stock")]
    NoStock,

    #[error("book is not allowed to borrow: {0}")]
    NotAllowedToBorrow(String),

    #[error("renew limit reached: already renewed {0} times")]
    RenewLimited(u32),

    #[error("{0} part should not be empty")]
    MissingPart(&'static str),

    #[error("can't resolve display name for user {user}: {source}")]
    UnresolvableUser {
        user: String,
        #[source]
        source: IdentityError,
    },

    #[error("the request at status {0} is not allowed to be cancelled")]
    NotCancellable(String),

    #[error("book has no library worker assigned")]
    NoLibworker,

    #[error("a copy should be chosen at keeper confirmation")]
    NoCopyChosen,

    #[error("unknown copy {0}")]
    UnknownCopy(String),

    #[error("copy {copy} is {status}, not in stock")]
    CopyNotInStock { copy: String, status: CopyStatus },

    #[error("copy {copy} is {status} and can not be removed")]
    CopyInUse { copy: String, status: CopyStatus },

    #[error("copy {copy} is kept by {keeper}, who is not a keeper of the book")]
    UnknownCopyKeeper { copy: String, keeper: String },

    #[error("can only step back to status {expected}, not {requested}")]
    InvalidBackward { expected: String, requested: String },

    #[error("{0}")]
    Invalid(String),
}

/// Errors returned by the book manager, the borrow engine and the workflow
/// engine.
#[derive(Error, Debug)]
pub enum LendingError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record is busy, retry later: {0}")]
    LockConflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Store failure before anything was written.
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    /// A multi-record write failed part way; everything written in the call
    /// has been compensated.
    #[error("{context}: {source}")]
    PartialWriteFailure {
        context: String,
        #[source]
        source: StoreError,
    },

    /// Compensation itself failed. Records are inconsistent and need an
    /// operator to retry or repair them.
    #[error("fatal inconsistency, manual retry required. {context}: {source}; rollback failed: {rollback}")]
    FatalInconsistency {
        context: String,
        source: StoreError,
        rollback: StoreError,
    },
}

pub type Result<T> = std::result::Result<T, LendingError>;

impl LendingError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LockConflict(_) => ErrorKind::LockConflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Store { .. } => ErrorKind::Store,
            Self::PartialWriteFailure { .. } => ErrorKind::PartialWriteFailure,
            Self::FatalInconsistency { .. } => ErrorKind::FatalInconsistency,
        }
    }

    /// Wrap a failed read. A missing record stays distinguishable.
    pub(crate) fn read(context: impl Into<String>, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            source => Self::Store {
                context: context.into(),
                source,
            },
        }
    }

    /// Wrap a failed write given the outcome of compensating it.
    pub(crate) fn after_rollback(
        context: impl Into<String>,
        source: StoreError,
        rollback: std::result::Result<(), StoreError>,
    ) -> Self {
        match rollback {
            Ok(()) => Self::PartialWriteFailure {
                context: context.into(),
                source,
            },
            Err(rollback) => Self::FatalInconsistency {
                context: context.into(),
                source,
                rollback,
            },
        }
    }

    /// Wrap an identity lookup failure for `user`.
    pub(crate) fn identity(user: &str, source: IdentityError) -> Self {
        Self::Validation(ValidationError::UnresolvableUser {
            user: user.to_string(),
            source,
        })
    }
}
