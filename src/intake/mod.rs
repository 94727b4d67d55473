//! Request Intake
//!
//! Validates a transfer request, assigns it an id, and hands the transfer
//! item plus a `pending` audit event to the broker in one batch. Acceptance
//! does not wait for settlement.

pub mod api;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::queue::{Broker, OutboundMessage, QueueError, QueueNames};
use crate::settlement::{AccountId, AuditEvent, TransactionId, TransactionStatus, TransferRequest};

/// Intake error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    // === Validation Errors ===
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Amount {0} has more precision than a transfer can carry")]
    AmountTooPrecise(Decimal),

    #[error("Source and target account cannot be the same")]
    SameAccount,

    #[error("Invalid account id: {0}")]
    InvalidAccount(AccountId),

    // === Lookup Errors ===
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Ledger not configured for this process")]
    LedgerUnavailable,

    // === System Errors ===
    #[error("Failed to enqueue transfer: {0}")]
    PublishFailed(String),

    #[error("Ledger error: {0}")]
    StoreError(String),
}

impl IntakeError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            IntakeError::InvalidPayload(_) => "INVALID_PARAMETER",
            IntakeError::InvalidAmount | IntakeError::AmountTooPrecise(_) => "INVALID_AMOUNT",
            IntakeError::SameAccount => "SAME_ACCOUNT",
            IntakeError::InvalidAccount(_) => "INVALID_ACCOUNT",
            IntakeError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            IntakeError::LedgerUnavailable => "SERVICE_UNAVAILABLE",
            IntakeError::PublishFailed(_) => "PUBLISH_FAILED",
            IntakeError::StoreError(_) => "LEDGER_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            IntakeError::InvalidPayload(_)
            | IntakeError::InvalidAmount
            | IntakeError::AmountTooPrecise(_)
            | IntakeError::SameAccount
            | IntakeError::InvalidAccount(_) => 400,
            IntakeError::TransactionNotFound(_) => 404,
            IntakeError::PublishFailed(_) | IntakeError::StoreError(_) => 500,
            IntakeError::LedgerUnavailable => 503,
        }
    }
}

impl From<QueueError> for IntakeError {
    fn from(e: QueueError) -> Self {
        IntakeError::PublishFailed(e.to_string())
    }
}

/// Queue messages carry `amount` as a JSON float; true when decoding it
/// yields exactly `amount` again.
fn survives_wire(amount: Decimal) -> bool {
    amount
        .to_f64()
        .and_then(|f| Decimal::from_str(&f.to_string()).ok())
        .is_some_and(|decoded| decoded == amount)
}

/// Check a transfer before it is enqueued
pub fn validate(
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: Decimal,
) -> Result<(), IntakeError> {
    if amount <= Decimal::ZERO {
        return Err(IntakeError::InvalidAmount);
    }
    if !survives_wire(amount) {
        return Err(IntakeError::AmountTooPrecise(amount));
    }
    for id in [from_account_id, to_account_id] {
        if id <= 0 {
            return Err(IntakeError::InvalidAccount(id));
        }
    }
    if from_account_id == to_account_id {
        return Err(IntakeError::SameAccount);
    }
    Ok(())
}

pub struct RequestIntake {
    broker: Arc<dyn Broker>,
    queues: QueueNames,
}

impl RequestIntake {
    pub fn new(broker: Arc<dyn Broker>, queues: QueueNames) -> Self {
        Self { broker, queues }
    }

    /// Accept a transfer and return its id without waiting for settlement
    pub async fn accept(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Decimal,
    ) -> Result<TransactionId, IntakeError> {
        validate(from_account_id, to_account_id, amount)?;

        let req = TransferRequest::new(
            TransactionId::generate(),
            from_account_id,
            to_account_id,
            amount,
        );
        let pending = AuditEvent::for_request(&req, TransactionStatus::Pending);
        let batch = [
            OutboundMessage::json(&self.queues.transfer, &req)?,
            OutboundMessage::json(&self.queues.audit, &pending)?,
        ];

        if let Err(e) = self.broker.publish_batch(&batch).await {
            warn!(
                transaction_id = %req.transaction_id,
                broker = self.broker.name(),
                error = %e,
                "Transfer rejected: publish failed"
            );
            return Err(e.into());
        }

        info!(
            transaction_id = %req.transaction_id,
            from = from_account_id,
            to = to_account_id,
            amount = %amount,
            "Transfer accepted"
        );
        Ok(req.transaction_id)
    }
}
