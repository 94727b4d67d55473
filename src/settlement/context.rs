//! Shared handles for intake and the consumers.

use std::sync::Arc;
use tracing::warn;

use super::types::AuditEvent;
use crate::queue::{Broker, OutboundMessage, QueueError, QueueNames};
use crate::store::LedgerStore;

/// Store, broker and queue names, built once at startup and handed to every
/// component through an `Arc`.
#[derive(Clone)]
pub struct SettlementContext {
    pub store: Arc<dyn LedgerStore>,
    pub broker: Arc<dyn Broker>,
    pub queues: QueueNames,
}

impl SettlementContext {
    pub fn new(store: Arc<dyn LedgerStore>, broker: Arc<dyn Broker>, queues: QueueNames) -> Self {
        Self {
            store,
            broker,
            queues,
        }
    }

    /// Publish an outcome event on the audit channel
    pub async fn publish_audit(&self, event: &AuditEvent) -> Result<(), QueueError> {
        let message = OutboundMessage::json(&self.queues.audit, event)?;
        self.broker.publish(message).await.inspect_err(|e| {
            warn!(
                transaction_id = %event.transaction_id,
                status = %event.status,
                error = %e,
                "Failed to publish audit event"
            );
        })
    }
}
