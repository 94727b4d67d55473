#![allow(dead_code)]

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use transfer_settlement::queue::Delivery;
use transfer_settlement::settlement::WorkerConfig;
use transfer_settlement::{
    AuditLogger, Broker, InMemoryBroker, InMemoryLedger, QueueNames, RequestIntake,
    SettlementContext, SettlementWorker,
};

/// In-memory ledger and broker wired into every component
pub struct Pipeline {
    pub ledger: InMemoryLedger,
    pub broker: Arc<InMemoryBroker>,
    pub queues: QueueNames,
    pub ctx: Arc<SettlementContext>,
    pub intake: RequestIntake,
    pub worker: Arc<SettlementWorker>,
    pub logger: Arc<AuditLogger>,
}

pub fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

pub fn pipeline(accounts: &[(i64, i64)]) -> Pipeline {
    let ledger = InMemoryLedger::with_accounts(accounts.iter().map(|(id, b)| (*id, dec(*b))));
    let broker = Arc::new(InMemoryBroker::new());
    let queues = QueueNames::default();
    let ctx = Arc::new(SettlementContext::new(
        Arc::new(ledger.clone()),
        broker.clone(),
        queues.clone(),
    ));

    let config = WorkerConfig {
        consumers: 4,
        receive_wait: Duration::from_millis(20),
        retry_backoff: Duration::from_millis(5),
    };

    Pipeline {
        intake: RequestIntake::new(broker.clone(), queues.clone()),
        worker: Arc::new(SettlementWorker::new(ctx.clone(), config.clone())),
        logger: Arc::new(AuditLogger::new(ctx.clone(), config)),
        ledger,
        broker,
        queues,
        ctx,
    }
}

impl Pipeline {
    /// Next message on `queue`, if one is ready
    pub async fn next(&self, queue: &str) -> Option<Delivery> {
        self.broker
            .receive(queue, Duration::from_millis(10))
            .await
            .expect("in-memory broker is online")
    }

    /// Hand every ready transfer item to the worker
    pub async fn drain_transfers(&self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.next(&self.queues.transfer).await {
            self.worker.handle_delivery(&delivery).await.unwrap();
            handled += 1;
        }
        handled
    }

    /// Hand every ready audit event to the logger
    pub async fn drain_audit(&self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.next(&self.queues.audit).await {
            self.logger.handle_delivery(&delivery).await.unwrap();
            handled += 1;
        }
        handled
    }
}
