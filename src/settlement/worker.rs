//! Settlement Worker
//!
//! Consumes transfer items and applies each one to the ledger in a single
//! store transaction, then emits the terminal status on the audit channel.
//!
//! # Per-item flow
//!
//! 1. Open a store transaction and claim the record (locked for the rest of
//!    the transaction). A terminal record is a no-op.
//! 2. Lock sender and receiver in ascending id order.
//! 3. Insufficient funds or a missing account: roll back, record `failed`.
//! 4. Debit, credit, record `successful`, commit.
//! 5. Any store error: roll back, record `failed` with the error text.
//! 6. Publish the terminal status, then ack the delivery.

use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::context::SettlementContext;
use super::state::{SettlementStage, TransactionStatus};
use super::types::{AuditEvent, TransactionRecord, TransferRequest};
use crate::config::ConsumerConfig;
use crate::queue::{Delivery, QueueError};
use crate::shutdown::ShutdownSignal;
use crate::store::{LedgerTx, StoreError};

pub const INSUFFICIENT_FUNDS: &str = "insufficient funds";
pub const SAME_ACCOUNT: &str = "sender and receiver must differ";
pub const NON_POSITIVE_AMOUNT: &str = "amount must be positive";

/// Result of settling one transfer
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Balances moved and committed
    Settled {
        sender_balance: Decimal,
        receiver_balance: Decimal,
    },
    /// Record was already terminal; nothing written
    AlreadySettled(TransactionStatus),
    /// Business rule refused the transfer
    Rejected(String),
    /// Store error aborted the transfer
    Failed(String),
}

impl SettlementOutcome {
    /// Terminal status reported on the audit channel
    pub fn status(&self) -> TransactionStatus {
        match self {
            SettlementOutcome::Settled { .. } => TransactionStatus::Successful,
            SettlementOutcome::AlreadySettled(status) => status.clone(),
            SettlementOutcome::Rejected(reason) | SettlementOutcome::Failed(reason) => {
                TransactionStatus::Failed(reason.clone())
            }
        }
    }
}

/// Configuration for a consumer pool
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent consumers on the channel
    pub consumers: usize,
    /// How long one receive call waits for a message
    pub receive_wait: Duration,
    /// Pause after a broker error or a requeued message
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for WorkerConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            consumers: config.consumers.max(1),
            receive_wait: Duration::from_millis(config.receive_wait_ms),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Settlement Worker
pub struct SettlementWorker {
    ctx: Arc<SettlementContext>,
    config: WorkerConfig,
}

impl SettlementWorker {
    pub fn new(ctx: Arc<SettlementContext>, config: WorkerConfig) -> Self {
        Self { ctx, config }
    }

    pub fn with_defaults(ctx: Arc<SettlementContext>) -> Self {
        Self::new(ctx, WorkerConfig::default())
    }

    /// Settle one transfer and publish its terminal status.
    ///
    /// Never returns an error: every failure ends up as a `failed` record.
    pub async fn settle(&self, req: &TransferRequest) -> SettlementOutcome {
        debug!(
            transaction_id = %req.transaction_id,
            stage = %SettlementStage::Received,
            "Settlement started"
        );

        let outcome = match self.ctx.store.begin().await {
            Ok(tx) => self.settle_in(tx, req).await,
            Err(e) => self.record_failure(req, SettlementOutcome::Failed(e.to_string())).await,
        };

        let event = AuditEvent::for_request(req, outcome.status());
        // Already logged; the ledger holds the terminal state either way
        let _ = self.ctx.publish_audit(&event).await;

        outcome
    }

    async fn settle_in(&self, mut tx: Box<dyn LedgerTx>, req: &TransferRequest) -> SettlementOutcome {
        match apply_transfer(tx.as_mut(), req).await {
            Ok(SettlementOutcome::AlreadySettled(status)) => {
                if let Err(e) = tx.commit().await {
                    warn!(transaction_id = %req.transaction_id, error = %e, "No-op commit failed");
                }
                info!(
                    transaction_id = %req.transaction_id,
                    status = %status,
                    "Redelivered transfer already settled"
                );
                SettlementOutcome::AlreadySettled(status)
            }
            Ok(settled @ SettlementOutcome::Settled { .. }) => match tx.commit().await {
                Ok(()) => {
                    info!(
                        transaction_id = %req.transaction_id,
                        from = req.from_account_id,
                        to = req.to_account_id,
                        amount = %req.amount,
                        stage = %SettlementStage::Committed,
                        "Transfer settled"
                    );
                    settled
                }
                Err(e) => {
                    self.rollback(tx, req).await;
                    self.record_failure(req, SettlementOutcome::Failed(e.to_string()))
                        .await
                }
            },
            Ok(refused) => {
                self.rollback(tx, req).await;
                self.record_failure(req, refused).await
            }
            Err(e) => {
                error!(transaction_id = %req.transaction_id, error = %e, "Settlement aborted");
                self.rollback(tx, req).await;
                self.record_failure(req, SettlementOutcome::Failed(e.to_string()))
                    .await
            }
        }
    }

    async fn rollback(&self, mut tx: Box<dyn LedgerTx>, req: &TransferRequest) {
        // A closed transaction has nothing left to undo
        if let Err(e) = tx.rollback().await
            && !matches!(e, StoreError::TransactionClosed)
        {
            warn!(transaction_id = %req.transaction_id, error = %e, "Rollback failed");
        }
        debug!(
            transaction_id = %req.transaction_id,
            stage = %SettlementStage::RolledBack,
            "Settlement rolled back"
        );
    }

    /// Write the `failed` record outside the aborted transaction
    async fn record_failure(
        &self,
        req: &TransferRequest,
        outcome: SettlementOutcome,
    ) -> SettlementOutcome {
        let status = outcome.status();
        warn!(
            transaction_id = %req.transaction_id,
            status = %status,
            "Transfer failed"
        );
        let record = TransactionRecord::from_request(req, status);
        if let Err(e) = self.ctx.store.upsert_record(&record).await {
            warn!(
                transaction_id = %req.transaction_id,
                error = %e,
                "Could not record failure, relying on audit event"
            );
        }
        outcome
    }

    /// Handle one transfer channel delivery, acking it when done.
    ///
    /// Returns `None` for items that were discarded without settlement.
    pub async fn handle_delivery(
        &self,
        delivery: &Delivery,
    ) -> Result<Option<SettlementOutcome>, QueueError> {
        let req: TransferRequest = match delivery.decode() {
            Ok(req) => req,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Discarding malformed transfer item");
                self.ctx.broker.ack(delivery).await?;
                return Ok(None);
            }
        };

        if req.transaction_id.is_blank() || req.amount <= Decimal::ZERO {
            warn!(
                tag = delivery.tag,
                transaction_id = %req.transaction_id,
                amount = %req.amount,
                "Discarding invalid transfer item"
            );
            if !req.transaction_id.is_blank() {
                // Closes out a `pending` record the logger may already hold
                let failed = AuditEvent::for_request(
                    &req,
                    TransactionStatus::Failed(NON_POSITIVE_AMOUNT.to_string()),
                );
                let _ = self.ctx.publish_audit(&failed).await;
            }
            self.ctx.broker.ack(delivery).await?;
            return Ok(None);
        }

        if delivery.is_redelivery() {
            debug!(
                transaction_id = %req.transaction_id,
                attempts = delivery.attempts,
                "Transfer redelivered"
            );
        }

        let outcome = self.settle(&req).await;
        self.ctx.broker.ack(delivery).await?;
        Ok(Some(outcome))
    }

    /// Run `consumers` competing consumers until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        info!(
            consumers = self.config.consumers,
            queue = %self.ctx.queues.transfer,
            broker = self.ctx.broker.name(),
            "Starting settlement worker"
        );

        let handles = (0..self.config.consumers).map(|consumer| {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.consume(consumer, &shutdown).await })
        });
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Settlement consumer panicked");
            }
        }

        info!("Settlement worker stopped");
    }

    async fn consume(&self, consumer: usize, shutdown: &ShutdownSignal) {
        let queue = &self.ctx.queues.transfer;
        while !shutdown.is_shutdown_requested() {
            let delivery = match self
                .ctx
                .broker
                .receive(queue, self.config.receive_wait)
                .await
            {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    warn!(consumer, error = %e, "Receive from transfer channel failed");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
            };

            if let Err(e) = self.handle_delivery(&delivery).await {
                error!(consumer, tag = delivery.tag, error = %e, "Failed to ack transfer item");
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        debug!(consumer, "Settlement consumer exiting");
    }
}

/// Steps 1-4 inside `tx`. `Ok` carries the business outcome; `Err` is a store
/// failure. Only a `Settled` outcome leaves writes worth committing.
async fn apply_transfer(
    tx: &mut dyn LedgerTx,
    req: &TransferRequest,
) -> Result<SettlementOutcome, StoreError> {
    let record = tx.claim_record(req).await?;
    if record.status.is_terminal() {
        return Ok(SettlementOutcome::AlreadySettled(record.status));
    }

    debug!(transaction_id = %req.transaction_id, stage = %SettlementStage::Validating);
    if req.amount <= Decimal::ZERO {
        return Ok(SettlementOutcome::Rejected(NON_POSITIVE_AMOUNT.to_string()));
    }
    if req.from_account_id == req.to_account_id {
        return Ok(SettlementOutcome::Rejected(SAME_ACCOUNT.to_string()));
    }

    let accounts = tx
        .lock_accounts(&[req.from_account_id, req.to_account_id])
        .await?;
    let Some(sender) = accounts.iter().find(|a| a.id == req.from_account_id) else {
        return Ok(SettlementOutcome::Rejected(format!(
            "sender account {} not found",
            req.from_account_id
        )));
    };
    if !accounts.iter().any(|a| a.id == req.to_account_id) {
        return Ok(SettlementOutcome::Rejected(format!(
            "receiver account {} not found",
            req.to_account_id
        )));
    }
    if sender.balance < req.amount {
        return Ok(SettlementOutcome::Rejected(INSUFFICIENT_FUNDS.to_string()));
    }

    debug!(transaction_id = %req.transaction_id, stage = %SettlementStage::Debiting);
    let sender_balance = tx.adjust_balance(req.from_account_id, -req.amount).await?;

    debug!(transaction_id = %req.transaction_id, stage = %SettlementStage::Crediting);
    let receiver_balance = tx.adjust_balance(req.to_account_id, req.amount).await?;

    tx.upsert_record(&TransactionRecord::from_request(
        req,
        TransactionStatus::Successful,
    ))
    .await?;

    Ok(SettlementOutcome::Settled {
        sender_balance,
        receiver_balance,
    })
}
