//! Transfer Settlement - asynchronous account-to-account transfers
//!
//! Intake accepts a transfer and enqueues it; a settlement worker applies it
//! to the ledger; an audit logger records every status change.
//!
//! # Modules
//!
//! - [`settlement`] - Transfer types, status, worker and audit logger
//! - [`store`] - Ledger store (PostgreSQL and in-memory)
//! - [`queue`] - Durable queue with ack/nack (PostgreSQL and in-memory)
//! - [`intake`] - Request validation and the HTTP layer
//! - [`health`] - Dependency monitor behind `/isalive`
//! - [`app`] - Process roles
//! - [`config`] / [`logging`] / [`db`] - Ambient setup

pub mod app;
pub mod config;
pub mod db;
pub mod health;
pub mod intake;
pub mod logging;
pub mod queue;
pub mod settlement;
pub mod shutdown;
pub mod store;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use intake::{IntakeError, RequestIntake};
pub use queue::{Broker, InMemoryBroker, PgQueue, QueueError, QueueNames};
pub use settlement::{
    AuditEvent, AuditLogger, SettlementContext, SettlementOutcome, SettlementWorker,
    TransactionId, TransactionStatus, TransferRequest,
};
pub use shutdown::ShutdownSignal;
pub use store::{InMemoryLedger, LedgerStore, LedgerTx, PgLedger, StoreError, UpsertOutcome};
