//! Audit Logger
//!
//! Consumes outcome events and upserts the transaction record under the
//! monotonic rule, so duplicates and out-of-order events are harmless.
//! Malformed events are dropped; store failures requeue the event.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::context::SettlementContext;
use super::types::{AuditEvent, TransactionRecord};
use super::worker::WorkerConfig;
use crate::queue::{Delivery, QueueError};
use crate::shutdown::ShutdownSignal;
use crate::store::{StoreError, UpsertOutcome};

/// What happened to one audit delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDisposition {
    /// Upserted and acked
    Applied(UpsertOutcome),
    /// Malformed, acked without touching the ledger
    Discarded,
    /// Store failed, nacked for redelivery
    Requeued,
}

pub struct AuditLogger {
    ctx: Arc<SettlementContext>,
    config: WorkerConfig,
}

impl AuditLogger {
    pub fn new(ctx: Arc<SettlementContext>, config: WorkerConfig) -> Self {
        Self { ctx, config }
    }

    pub fn with_defaults(ctx: Arc<SettlementContext>) -> Self {
        Self::new(ctx, WorkerConfig::default())
    }

    /// Upsert the record described by `event`
    pub async fn apply(&self, event: &AuditEvent) -> Result<UpsertOutcome, StoreError> {
        let record = TransactionRecord::from_event(event);
        let outcome = self.ctx.store.upsert_record(&record).await?;

        match outcome {
            UpsertOutcome::Unchanged => debug!(
                transaction_id = %event.transaction_id,
                status = %event.status,
                "Stale or duplicate audit event ignored"
            ),
            _ => info!(
                transaction_id = %event.transaction_id,
                status = %event.status,
                outcome = ?outcome,
                "Transaction record updated"
            ),
        }
        Ok(outcome)
    }

    /// Handle one audit channel delivery
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<AuditDisposition, QueueError> {
        let event: AuditEvent = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Discarding malformed audit event");
                self.ctx.broker.ack(delivery).await?;
                return Ok(AuditDisposition::Discarded);
            }
        };

        match self.apply(&event).await {
            Ok(outcome) => {
                self.ctx.broker.ack(delivery).await?;
                Ok(AuditDisposition::Applied(outcome))
            }
            Err(e) => {
                error!(
                    transaction_id = %event.transaction_id,
                    attempts = delivery.attempts,
                    error = %e,
                    "Audit upsert failed, requeueing"
                );
                self.ctx.broker.nack(delivery).await?;
                Ok(AuditDisposition::Requeued)
            }
        }
    }

    /// Run `consumers` competing consumers until shutdown
    pub async fn run(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) {
        info!(
            consumers = self.config.consumers,
            queue = %self.ctx.queues.audit,
            broker = self.ctx.broker.name(),
            "Starting audit logger"
        );

        let handles = (0..self.config.consumers).map(|consumer| {
            let logger = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { logger.consume(consumer, &shutdown).await })
        });
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Audit consumer panicked");
            }
        }

        info!("Audit logger stopped");
    }

    async fn consume(&self, consumer: usize, shutdown: &ShutdownSignal) {
        let queue = &self.ctx.queues.audit;
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
                    warn!(consumer, error = %e, "Receive from audit channel failed");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    continue;
                }
            };

            match self.handle_delivery(&delivery).await {
                Ok(AuditDisposition::Requeued) => {
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(consumer, tag = delivery.tag, error = %e, "Failed to settle audit delivery");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
        debug!(consumer, "Audit consumer exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Broker, InMemoryBroker, OutboundMessage, QueueNames};
    use crate::settlement::state::TransactionStatus;
    use crate::settlement::types::TransferRequest;
    use crate::store::{InMemoryLedger, LedgerStore};
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn setup() -> (InMemoryLedger, Arc<InMemoryBroker>, AuditLogger) {
        let ledger = InMemoryLedger::new();
        let broker = Arc::new(InMemoryBroker::new());
        let ctx = Arc::new(SettlementContext::new(
            Arc::new(ledger.clone()),
            broker.clone(),
            QueueNames::default(),
        ));
        (ledger, broker, AuditLogger::with_defaults(ctx))
    }

    fn event(id: &str, status: TransactionStatus) -> AuditEvent {
        let req = TransferRequest::new(id.into(), 1, 2, Decimal::from(25));
        AuditEvent::for_request(&req, status)
    }

    async fn next(broker: &InMemoryBroker) -> Delivery {
        broker
            .receive("transaction_logs", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_pending_then_terminal_promotes() {
        let (ledger, _, logger) = setup();
        assert_eq!(
            logger.apply(&event("a", TransactionStatus::Pending)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            logger.apply(&event("a", TransactionStatus::Successful)).await.unwrap(),
            UpsertOutcome::Promoted
        );

        let record = ledger.record(&"a".into()).await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Successful);
    }

    #[tokio::test]
    async fn test_late_pending_does_not_downgrade() {
        let (ledger, _, logger) = setup();
        logger
            .apply(&event("b", TransactionStatus::Successful))
            .await
            .unwrap();
        assert_eq!(
            logger.apply(&event("b", TransactionStatus::Pending)).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let record = ledger.record(&"b".into()).await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Successful);
    }

    #[tokio::test]
    async fn test_terminal_states_do_not_flip() {
        let (ledger, _, logger) = setup();
        let failed = TransactionStatus::Failed("insufficient funds".into());
        logger.apply(&event("c", failed.clone())).await.unwrap();
        logger
            .apply(&event("c", TransactionStatus::Successful))
            .await
            .unwrap();

        let record = ledger.record(&"c".into()).await.unwrap().unwrap();
        assert_eq!(record.status, failed);
    }

    #[tokio::test]
    async fn test_malformed_event_is_discarded() {
        let (ledger, broker, logger) = setup();
        broker
            .publish(OutboundMessage {
                queue: "transaction_logs".into(),
                payload: br#"{"id":"d","sender":1,"receiver":2,"amount":1,"status":"lost"}"#.to_vec(),
            })
            .await
            .unwrap();

        let delivery = next(&broker).await;
        assert_eq!(
            logger.handle_delivery(&delivery).await.unwrap(),
            AuditDisposition::Discarded
        );
        assert_eq!(broker.unacked_count("transaction_logs"), 0);
        assert_eq!(ledger.record_count(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_requeues_event() {
        let (ledger, broker, logger) = setup();
        broker
            .publish(OutboundMessage::json("transaction_logs", &event("e", TransactionStatus::Pending)).unwrap())
            .await
            .unwrap();

        ledger.set_available(false);
        let delivery = next(&broker).await;
        assert_eq!(
            logger.handle_delivery(&delivery).await.unwrap(),
            AuditDisposition::Requeued
        );
        assert_eq!(broker.ready_count("transaction_logs"), 1);

        ledger.set_available(true);
        let retry = next(&broker).await;
        assert!(retry.is_redelivery());
        assert_eq!(
            logger.handle_delivery(&retry).await.unwrap(),
            AuditDisposition::Applied(UpsertOutcome::Inserted)
        );
        assert_eq!(broker.ready_count("transaction_logs"), 0);
        assert_eq!(broker.unacked_count("transaction_logs"), 0);
    }

    #[tokio::test]
    async fn test_failed_event_keeps_error_message() {
        let (ledger, _, logger) = setup();
        logger
            .apply(&event("f", TransactionStatus::Failed("receiver account 9 not found".into())))
            .await
            .unwrap();

        let record = ledger.record(&"f".into()).await.unwrap().unwrap();
        assert_eq!(
            record.status.error_message(),
            Some("receiver account 9 not found")
        );
    }
}
