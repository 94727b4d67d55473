//! In-memory broker with ack/nack semantics.
//!
//! Handed-out messages sit in an unacked set until acked; a nack puts them at
//! the back of their queue with the attempt counter preserved.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, Delivery, OutboundMessage, QueueError};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<i64, StoredMessage>,
    notify: Arc<Notify>,
}

/// Process-local [`Broker`]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicI64,
    available: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicI64::new(1),
            available: AtomicBool::new(true),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("in-memory broker is offline".to_string()))
        }
    }

    /// Simulate losing (or regaining) the broker connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages waiting for a consumer
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages handed out and not yet acked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Decoded copies of the ready messages, oldest first
    pub fn peek_json(&self, queue: &str) -> Vec<serde_json::Value> {
        self.queues()
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .filter_map(|m| serde_json::from_slice(&m.payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .notify
            .clone()
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.queues();
        let state = queues.get_mut(queue)?;
        let mut message = state.ready.pop_front()?;
        message.attempts += 1;

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            payload: message.payload.clone(),
            attempts: message.attempts,
        };
        state.unacked.insert(tag, message);
        Some(delivery)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.check_available()?;
        self.queues().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish_batch(&self, messages: &[OutboundMessage]) -> Result<(), QueueError> {
        self.check_available()?;
        let mut wakeups = Vec::with_capacity(messages.len());
        {
            let mut queues = self.queues();
            for message in messages {
                let state = queues.entry(message.queue.clone()).or_default();
                state.ready.push_back(StoredMessage {
                    payload: message.payload.clone(),
                    attempts: 0,
                });
                wakeups.push(state.notify.clone());
            }
        }
        for notify in wakeups {
            notify.notify_one();
        }
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        let notify = self.notifier(queue);
        loop {
            self.check_available()?;
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            // notify_one leaves a permit when nobody waits, so a publish that
            // lands between try_take and here is not lost
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.check_available()?;
        let mut queues = self.queues();
        queues
            .get_mut(&delivery.queue)
            .and_then(|q| q.unacked.remove(&delivery.tag))
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.check_available()?;
        let notify = {
            let mut queues = self.queues();
            let state = queues
                .get_mut(&delivery.queue)
                .ok_or(QueueError::UnknownDelivery(delivery.tag))?;
            let message = state
                .unacked
                .remove(&delivery.tag)
                .ok_or(QueueError::UnknownDelivery(delivery.tag))?;
            state.ready.push_back(message);
            state.notify.clone()
        };
        notify.notify_one();
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()
    }
}
