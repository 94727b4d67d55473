//! Ledger Store
//!
//! Accounts and transaction records, with atomic read-modify-write through
//! [`LedgerTx`]. Two implementations:
//! - [`PgLedger`]: PostgreSQL (`clients`, `transactions`), row locks via
//!   `SELECT ... FOR UPDATE`
//! - [`InMemoryLedger`]: per-row async mutexes standing in for row locks
//!
//! # Record upsert rule
//!
//! Every record write, inside or outside a settlement transaction, goes
//! through the same monotonic rule: insert if absent, otherwise update only
//! a `pending` row to a terminal status (see
//! [`TransactionStatus::can_advance_to`]).

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::settlement::state::TransactionStatus;
use crate::settlement::types::{
    Account, AccountId, TransactionId, TransactionRecord, TransferRequest,
};

/// Ledger store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Ledger store unavailable: {0}")]
    Unavailable(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account {0} is not locked by this transaction")]
    AccountNotLocked(AccountId),

    #[error("Balance of account {0} would become negative")]
    NegativeBalance(AccountId),

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("Transaction already finished")]
    TransactionClosed,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Result of a record upsert under the monotonic rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed; inserted as given
    Inserted,
    /// Pending record moved to a terminal status
    Promoted,
    /// Existing record kept (duplicate or out-of-order event)
    Unchanged,
}

/// Decide how an incoming record status applies to the stored one.
pub fn resolve_upsert(
    existing: Option<&TransactionStatus>,
    incoming: &TransactionStatus,
) -> UpsertOutcome {
    match existing {
        None => UpsertOutcome::Inserted,
        Some(current) if current.can_advance_to(incoming) => UpsertOutcome::Promoted,
        Some(_) => UpsertOutcome::Unchanged,
    }
}

/// Ledger store handle shared by every consumer
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a store transaction
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Upsert a record outside any settlement transaction
    async fn upsert_record(&self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError>;

    /// Read a committed record
    async fn record(&self, id: &TransactionId) -> Result<Option<TransactionRecord>, StoreError>;

    /// Read a committed account
    async fn account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Connectivity check used by the health monitor
    async fn ping(&self) -> Result<(), StoreError>;
}

/// One atomic unit of ledger work.
///
/// Nothing written through a `LedgerTx` is visible to other readers before
/// [`commit`](LedgerTx::commit). Dropping an unfinished transaction rolls it
/// back and releases its locks.
#[async_trait]
pub trait LedgerTx: Send {
    /// Ensure a record exists for the request (inserting it `pending` on
    /// first touch) and lock it for the rest of the transaction. Concurrent
    /// deliveries of the same id serialize here.
    async fn claim_record(&mut self, req: &TransferRequest) -> Result<TransactionRecord, StoreError>;

    /// Lock account rows in ascending id order. Missing accounts are simply
    /// absent from the result.
    async fn lock_accounts(&mut self, ids: &[AccountId]) -> Result<Vec<Account>, StoreError>;

    /// Add `delta` to a locked account, returning the new balance
    async fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Decimal, StoreError>;

    /// Upsert a record within this transaction
    async fn upsert_record(&mut self, record: &TransactionRecord) -> Result<UpsertOutcome, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
