//! Durable Queue
//!
//! At-least-once message delivery over named queues. Consumers must `ack`
//! a delivery once it is fully handled; a `nack` (or a consumer that never
//! answers) makes the message deliverable again.
//!
//! - [`PgQueue`]: `queue_messages` table, claimed with `FOR UPDATE SKIP LOCKED`
//!   under a visibility timeout
//! - [`InMemoryBroker`]: process-local queues for tests and the `all` role

pub mod memory;
pub mod postgres;

pub use memory::InMemoryBroker;
pub use postgres::PgQueue;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Broker errors
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(i64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                QueueError::Unavailable(e.to_string())
            }
            other => QueueError::Database(other.to_string()),
        }
    }
}

/// Channel names for the two logical queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    /// Transfer work items
    pub transfer: String,
    /// Outcome events
    pub audit: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            transfer: "transactions".to_string(),
            audit: "transaction_logs".to_string(),
        }
    }
}

/// Message ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub queue: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Serialize `body` as the JSON payload for `queue`
    pub fn json<T: Serialize>(queue: &str, body: &T) -> Result<Self, QueueError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self {
            queue: queue.to_string(),
            payload,
        })
    }
}

/// A message handed to a consumer, pending ack/nack
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    /// Number of times this message has been handed out, this one included
    pub attempts: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.attempts > 1
    }

    /// Decode the JSON payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Broker handle shared by intake and every consumer
#[async_trait]
pub trait Broker: Send + Sync {
    /// Get broker name for logging
    fn name(&self) -> &'static str;

    /// Make sure a queue exists (idempotent)
    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Publish all messages or none of them
    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<(), QueueError>;

    async fn publish(&self, message: OutboundMessage) -> Result<(), QueueError> {
        self.publish_batch(std::slice::from_ref(&message)).await
    }

    /// Wait up to `wait` for the next message; `None` when nothing arrived
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a handled message for good
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a message to its queue for redelivery
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Connectivity check used by the health monitor
    async fn ping(&self) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_names() {
        let names = QueueNames::default();
        assert_eq!(names.transfer, "transactions");
        assert_eq!(names.audit, "transaction_logs");
    }

    #[test]
    fn test_outbound_json_and_decode() {
        let msg = OutboundMessage::json("q", &serde_json::json!({"id": "a", "n": 1})).unwrap();
        assert_eq!(msg.queue, "q");

        let delivery = Delivery {
            tag: 1,
            queue: msg.queue.clone(),
            payload: msg.payload,
            attempts: 2,
        };
        let value: serde_json::Value = delivery.decode().unwrap();
        assert_eq!(value["id"], "a");
        assert!(delivery.is_redelivery());
    }
}
