//! Booklend - book lending over a shared record store.
//!
//! Books live as three linked records (public catalogue entry, custody
//! details, inventory counters). A loan is one MASTER document in the
//! workflow channel plus one satellite document in the inbox of every
//! participant. Each satellite holds that participant's view of the
//! MASTER and follows it through the BORROW, RENEW and RETURN steps.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        REST API (axum)                        │
//! └──────────────────────────────┬───────────────────────────────┘
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                         LendingNode                           │
//! │  BookManager    - create / update / delete / upload books     │
//! │  BorrowEngine   - admission checks, loan fan-out              │
//! │  WorkflowEngine - transitions, inventory moves, cancel        │
//! └───────┬──────────────────────┬──────────────────────┬────────┘
//!         │ KeyedLock            │ Compensation         │ Directory
//! ┌───────┴──────────────────────┴──────────────────────┴────────┐
//! │                    RecordStore (MemoryStore)                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every multi-record write runs under per-record locks and records an
//! undo entry per write. A failed write unwinds what was done; a failed
//! unwind is reported as a fatal inconsistency.

// === Core Modules ===

/// Lending error taxonomy.
pub mod error;

/// Records, partitions and store backends.
pub mod store;

/// Per-record locks.
pub mod lock;

/// Undo log for multi-record writes.
pub mod compensation;

/// Book and loan data model.
pub mod model;

// === Engines ===

/// Book entity manager.
pub mod books;

/// Loan fan-out.
pub mod borrow;

/// Loan workflow state machine.
pub mod workflow;

// === Service ===

/// Lending node.
pub mod node;

/// REST API.
pub mod api;

#[cfg(test)]
mod test_support;

// === Re-exports ===

pub use books::{BookManager, UploadMessage, UploadStatus};
pub use borrow::{BorrowEngine, StartedBorrow, UniformSelector, WorkerSelector};
pub use error::{ErrorKind, LendingError, ValidationError};
pub use node::{LendingNode, NodeConfig, NodeError};
pub use workflow::{CancelOutcome, TransitionOutcome, WorkflowEngine, WorkflowRequest};
