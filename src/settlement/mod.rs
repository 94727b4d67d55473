//! Transfer Settlement
//!
//! Moves money between ledger accounts asynchronously. Intake publishes a
//! transfer item and a `pending` audit event; the [`SettlementWorker`]
//! applies the transfer; the [`AuditLogger`] persists every status change.
//!
//! # Record lifecycle
//!
//! ```text
//! PENDING → SUCCESSFUL
//!    ↓
//!  FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Conservation**: debit and credit of one transfer commit together or not at all
//! 2. **Idempotency**: the record is claimed and locked before any balance is read;
//!    a terminal record turns a redelivery into a no-op
//! 3. **Monotonic records**: a terminal status is never overwritten
//! 4. **Lock order**: account rows are always locked in ascending id order

pub mod audit;
pub mod context;
pub mod state;
pub mod types;
pub mod worker;

pub use audit::{AuditDisposition, AuditLogger};
pub use context::SettlementContext;
pub use state::{SettlementStage, TransactionStatus};
pub use types::{
    Account, AccountId, AuditEvent, TransactionId, TransactionRecord, TransferRequest,
};
pub use worker::{INSUFFICIENT_FUNDS, SettlementOutcome, SettlementWorker, WorkerConfig};
