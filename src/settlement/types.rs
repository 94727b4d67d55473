//! Settlement Core Types
//!
//! Queue message shapes and the ledger's account/record rows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::TransactionStatus;

/// Ledger account identifier (`clients.id`)
pub type AccountId = i64;

/// Opaque transaction identifier assigned by intake.
///
/// Freshly generated ids are UUID v4 strings, but any non-empty string read
/// off the queue is accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a new unique TransactionId
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transfer channel work item.
///
/// Wire format: `{id, from_account_id, to_account_id, amount}` with a JSON
/// number amount. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "id")]
    pub transaction_id: TransactionId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

impl TransferRequest {
    pub fn new(
        transaction_id: TransactionId,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Decimal,
    ) -> Self {
        Self {
            transaction_id,
            from_account_id,
            to_account_id,
            amount,
        }
    }
}

/// Audit channel outcome event.
///
/// Wire format: `{id, sender, receiver, amount, status, error_message?}`.
/// Decoding fails for unknown status words and blank ids, so a malformed
/// event never reaches the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AuditMessage", into = "AuditMessage")]
pub struct AuditEvent {
    pub transaction_id: TransactionId,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub amount: Decimal,
    pub status: TransactionStatus,
}

impl AuditEvent {
    /// Outcome event for a transfer
    pub fn for_request(req: &TransferRequest, status: TransactionStatus) -> Self {
        Self {
            transaction_id: req.transaction_id.clone(),
            sender_id: req.from_account_id,
            receiver_id: req.to_account_id,
            amount: req.amount,
            status,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AuditMessage {
    id: TransactionId,
    sender: AccountId,
    receiver: AccountId,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl TryFrom<AuditMessage> for AuditEvent {
    type Error = String;

    fn try_from(msg: AuditMessage) -> Result<Self, Self::Error> {
        if msg.id.is_blank() {
            return Err("transaction id must not be empty".to_string());
        }
        let status = TransactionStatus::from_parts(&msg.status, msg.error_message.as_deref())
            .ok_or_else(|| format!("unknown status: {}", msg.status))?;
        Ok(Self {
            transaction_id: msg.id,
            sender_id: msg.sender,
            receiver_id: msg.receiver,
            amount: msg.amount,
            status,
        })
    }
}

impl From<AuditEvent> for AuditMessage {
    fn from(event: AuditEvent) -> Self {
        let error_message = event.status.error_message().map(str::to_string);
        Self {
            id: event.transaction_id,
            sender: event.sender_id,
            receiver: event.receiver_id,
            amount: event.amount,
            status: event.status.as_str().to_string(),
            error_message,
        }
    }
}

/// Ledger account row (`clients`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub balance: Decimal,
}

/// Ledger transaction row (`transactions`)
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn from_request(req: &TransferRequest, status: TransactionStatus) -> Self {
        Self {
            transaction_id: req.transaction_id.clone(),
            sender_id: req.from_account_id,
            receiver_id: req.to_account_id,
            amount: req.amount,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn from_event(event: &AuditEvent) -> Self {
        Self {
            transaction_id: event.transaction_id.clone(),
            sender_id: event.sender_id,
            receiver_id: event.receiver_id,
            amount: event.amount,
            status: event.status.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
        assert!(!a.is_blank());
    }

    #[test]
    fn test_transfer_request_wire_format() {
        let json = r#"{"id":"tx-1","from_account_id":1,"to_account_id":2,"amount":40.5}"#;
        let req: TransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.transaction_id.as_str(), "tx-1");
        assert_eq!(req.from_account_id, 1);
        assert_eq!(req.to_account_id, 2);
        assert_eq!(req.amount, Decimal::new(405, 1));

        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], "tx-1");
        assert!(value["amount"].is_number());
    }

    #[test]
    fn test_audit_event_wire_format() {
        let req = TransferRequest::new("tx-2".into(), 1, 2, Decimal::from(100));
        let event = AuditEvent::for_request(
            &req,
            TransactionStatus::Failed("insufficient funds".to_string()),
        );

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], "tx-2");
        assert_eq!(value["sender"], 1);
        assert_eq!(value["receiver"], 2);
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_message"], "insufficient funds");
    }

    #[test]
    fn test_pending_event_omits_error_message() {
        let req = TransferRequest::new("tx-3".into(), 1, 2, Decimal::from(5));
        let value = serde_json::to_value(AuditEvent::for_request(&req, TransactionStatus::Pending))
            .unwrap();
        assert!(value.get("error_message").is_none());
    }

    #[test]
    fn test_audit_event_accepts_capitalized_status() {
        let json = r#"{"id":"tx-4","sender":1,"receiver":2,"amount":10,"status":"Pending"}"#;
        let event: AuditEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_audit_event_rejects_unknown_status() {
        let json = r#"{"id":"tx-5","sender":1,"receiver":2,"amount":10,"status":"not enough money"}"#;
        assert!(serde_json::from_str::<AuditEvent>(json).is_err());
    }

    #[test]
    fn test_audit_event_rejects_blank_id() {
        let json = r#"{"id":" ","sender":1,"receiver":2,"amount":10,"status":"pending"}"#;
        assert!(serde_json::from_str::<AuditEvent>(json).is_err());
    }
}
