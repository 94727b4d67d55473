//! PostgreSQL table queue.
//!
//! Every message is a `queue_messages` row. A consumer claims the oldest
//! visible row with `FOR UPDATE SKIP LOCKED` and pushes its `visible_at` past
//! the visibility timeout; `ack` deletes the row, `nack` (or a consumer that
//! dies) lets it become visible again.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, Delivery, OutboundMessage, QueueError};

const INSERT_MESSAGE: &str = r#"
INSERT INTO queue_messages (queue, payload, attempts, visible_at, created_at)
VALUES ($1, $2, 0, NOW(), NOW())
"#;

const CLAIM_MESSAGE: &str = r#"
UPDATE queue_messages
SET attempts = attempts + 1,
    visible_at = NOW() + make_interval(secs => $2)
WHERE id = (
    SELECT id FROM queue_messages
    WHERE queue = $1 AND visible_at <= NOW()
    ORDER BY id
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING id, payload, attempts
"#;

const DELETE_MESSAGE: &str = "DELETE FROM queue_messages WHERE id = $1 AND queue = $2";

const RELEASE_MESSAGE: &str = r#"
UPDATE queue_messages
SET visible_at = NOW() + make_interval(secs => $3)
WHERE id = $1 AND queue = $2
"#;

/// PostgreSQL-backed [`Broker`]
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    poll_interval: Duration,
    visibility_timeout: Duration,
    redelivery_delay: Duration,
}

impl PgQueue {
    pub fn new(
        pool: PgPool,
        poll_interval: Duration,
        visibility_timeout: Duration,
        redelivery_delay: Duration,
    ) -> Self {
        Self {
            pool,
            poll_interval,
            visibility_timeout,
            redelivery_delay,
        }
    }

    async fn try_claim(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let row = sqlx::query(CLAIM_MESSAGE)
            .bind(queue)
            .bind(self.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attempts: i32 = row.try_get("attempts")?;
        Ok(Some(Delivery {
            tag: row.try_get("id")?,
            queue: queue.to_string(),
            payload: row.try_get("payload")?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }
}

#[async_trait]
impl Broker for PgQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        // Queues are rows in one table; nothing to create per queue
        debug!(queue, "Queue declared");
        Ok(())
    }

    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(INSERT_MESSAGE)
                .bind(&message.queue)
                .bind(&message.payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_claim(queue).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let deleted = sqlx::query(DELETE_MESSAGE)
            .bind(delivery.tag)
            .bind(&delivery.queue)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(QueueError::UnknownDelivery(delivery.tag));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let updated = sqlx::query(RELEASE_MESSAGE)
            .bind(delivery.tag)
            .bind(&delivery.queue)
            .bind(self.redelivery_delay.as_secs_f64())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(QueueError::UnknownDelivery(delivery.tag));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
