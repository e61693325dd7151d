//! In-memory order queue.
//!
//! At-least-once delivery with an ack timeout, delayed redelivery on
//! explicit rejection and a dead-letter path bounded by `max_deliveries`.
//! Deferred deliveries come back without spending an attempt.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::ExecError;
use crate::ports::{
    DeadLetter, Delivery, Disposition, OrderQueue, PublishConfirm, QueueTopology, Received,
};

// =============================================================================
// Queue Configuration
// =============================================================================

/// Delivery policy of the order queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Exchange, queue and routing key names
    pub topology: QueueTopology,
    /// Unsettled deliveries become visible again after this window
    pub ack_timeout: Duration,
    /// Delay before an explicitly redelivered message is visible again
    pub retry_delay: Duration,
    /// Attempts allowed before the message is dead-lettered; deferred
    /// deliveries do not count
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topology: QueueTopology::default(),
            ack_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(200),
            max_deliveries: 5,
        }
    }
}

// =============================================================================
// Memory Order Queue
// =============================================================================

#[derive(Debug, Clone)]
struct Message {
    correlation_id: String,
    routing_key: String,
    payload: Vec<u8>,
    delivery_count: u32,
    attempts: u32,
    visible_at: Instant,
}

struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, InFlight>,
    dead: Vec<DeadLetter>,
    next_tag: u64,
}

/// In-memory order queue.
pub struct MemoryOrderQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    /// Whether the broker should nack the next publish
    nack_next: AtomicBool,
}

impl MemoryOrderQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            nack_next: AtomicBool::new(false),
        }
    }

    /// Configure the next publish to be nacked by the broker.
    pub fn set_nack_next(&self, nack: bool) {
        self.nack_next.store(nack, Ordering::SeqCst);
    }

    /// Messages waiting to be delivered (including delayed ones).
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Whether every published message has been settled.
    pub fn is_drained(&self) -> bool {
        self.lock()
            .map(|s| s.ready.is_empty() && s.in_flight.is_empty())
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, ExecError> {
        self.state
            .lock()
            .map_err(|e| ExecError::Queue(format!("Failed to acquire queue lock: {}", e)))
    }

    fn dead_letter(&self, state: &mut QueueState, message: Message, reason: String) -> DeadLetter {
        error!(
            correlation_id = %message.correlation_id,
            delivery_count = message.delivery_count,
            %reason,
            dead_letter_queue = %self.config.topology.dead_letter_queue,
            "Message dead-lettered"
        );
        let letter = DeadLetter {
            correlation_id: message.correlation_id,
            original_exchange: self.config.topology.exchange.clone(),
            original_routing_key: message.routing_key,
            routing_key: self.config.topology.dead_letter_routing_key.clone(),
            payload: message.payload,
            reason,
            delivery_count: message.delivery_count,
            dead_lettered_at: Utc::now(),
        };
        state.dead.push(letter.clone());
        letter
    }

    /// Return expired in-flight deliveries to the ready queue.
    fn reclaim_expired(state: &mut QueueState, now: Instant) {
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in expired {
            if let Some(flight) = state.in_flight.remove(&tag) {
                warn!(
                    delivery_tag = tag,
                    correlation_id = %flight.message.correlation_id,
                    "Ack timeout elapsed, message requeued"
                );
                let mut message = flight.message;
                message.visible_at = now;
                state.ready.push_back(message);
            }
        }
    }
}

impl Default for MemoryOrderQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl OrderQueue for MemoryOrderQueue {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        correlation_id: String,
    ) -> Result<PublishConfirm, ExecError> {
        if self.nack_next.swap(false, Ordering::SeqCst) {
            return Ok(PublishConfirm::Nack { cause: "Simulated broker nack".to_string() });
        }

        if routing_key != self.config.topology.routing_key {
            return Ok(PublishConfirm::Returned { reply_text: "NO_ROUTE".to_string() });
        }

        let mut state = self.lock()?;
        state.ready.push_back(Message {
            correlation_id,
            routing_key: routing_key.to_string(),
            payload,
            delivery_count: 0,
            attempts: 0,
            visible_at: Instant::now(),
        });
        Ok(PublishConfirm::Ack)
    }

    async fn next_delivery(&self) -> Result<Received, ExecError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        Self::reclaim_expired(&mut state, now);

        let mut received = Received::default();
        loop {
            let Some(position) = state.ready.iter().position(|m| m.visible_at <= now) else {
                return Ok(received);
            };
            let Some(mut message) = state.ready.remove(position) else {
                return Ok(received);
            };

            message.delivery_count += 1;
            message.attempts += 1;
            if message.attempts > self.config.max_deliveries {
                let reason = format!(
                    "delivery limit exceeded ({} > {})",
                    message.attempts, self.config.max_deliveries
                );
                let letter = self.dead_letter(&mut state, message, reason);
                received.dead_lettered.push(letter);
                continue;
            }

            state.next_tag += 1;
            let delivery_tag = state.next_tag;
            let delivery = Delivery {
                delivery_tag,
                delivery_count: message.delivery_count,
                redelivered: message.delivery_count > 1,
                correlation_id: message.correlation_id.clone(),
                exchange: self.config.topology.exchange.clone(),
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
            };
            state.in_flight.insert(
                delivery_tag,
                InFlight { message, deadline: now + self.config.ack_timeout },
            );
            received.delivery = Some(delivery);
            return Ok(received);
        }
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), ExecError> {
        let mut state = self.lock()?;
        let flight = state.in_flight.remove(&delivery_tag).ok_or_else(|| {
            ExecError::Queue(format!("Unknown or expired delivery tag {}", delivery_tag))
        })?;

        debug!(delivery_tag, disposition = disposition.as_str(), "Delivery settled");
        match disposition {
            Disposition::Ack => {},
            Disposition::Redeliver => {
                let mut message = flight.message;
                message.visible_at = Instant::now() + self.config.retry_delay;
                state.ready.push_back(message);
            },
            Disposition::Defer => {
                let mut message = flight.message;
                message.attempts = message.attempts.saturating_sub(1);
                message.visible_at = Instant::now() + self.config.retry_delay;
                state.ready.push_back(message);
            },
            Disposition::DeadLetter { reason } => {
                self.dead_letter(&mut state, flight.message, reason);
            },
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ExecError> {
        Ok(self.lock()?.dead.clone())
    }

    fn topology(&self) -> &QueueTopology {
        &self.config.topology
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> QueueConfig {
        QueueConfig {
            topology: QueueTopology::default(),
            ack_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            max_deliveries: 3,
        }
    }

    async fn publish(queue: &MemoryOrderQueue, id: &str) -> PublishConfirm {
        queue
            .publish("seckill.order", id.as_bytes().to_vec(), id.to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let queue = MemoryOrderQueue::new(test_config());
        assert_eq!(publish(&queue, "1").await, PublishConfirm::Ack);

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id, "1");
        assert_eq!(delivery.exchange, "seckill.direct");
        assert_eq!(delivery.delivery_count, 1);
        assert!(!delivery.redelivered);
        assert!(queue.receive().await.unwrap().is_none());

        queue.settle(delivery.delivery_tag, Disposition::Ack).await.unwrap();
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_returned() {
        let queue = MemoryOrderQueue::new(test_config());
        let confirm = queue.publish("wrong.key", b"{}".to_vec(), "1".into()).await.unwrap();

        assert!(matches!(confirm, PublishConfirm::Returned { .. }));
        assert!(queue.is_drained());
    }

    #[tokio::test]
    async fn test_nacked_publish_is_not_enqueued() {
        let queue = MemoryOrderQueue::new(test_config());
        queue.set_nack_next(true);

        assert!(matches!(publish(&queue, "1").await, PublishConfirm::Nack { .. }));
        assert_eq!(queue.ready_len(), 0);
        assert_eq!(publish(&queue, "2").await, PublishConfirm::Ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_delivery_is_redelivered_after_ack_timeout() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        let first = queue.receive().await.unwrap().unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.correlation_id, "1");
        assert!(second.redelivered);
        assert_eq!(second.delivery_count, 2);

        // The stale tag can no longer be settled
        assert!(queue.settle(first.delivery_tag, Disposition::Ack).await.is_err());
        queue.settle(second.delivery_tag, Disposition::Ack).await.unwrap();
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeliver_waits_for_retry_delay() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.settle(delivery.delivery_tag, Disposition::Redeliver).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(150)).await;
        let again = queue.receive().await.unwrap().unwrap();
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_explicit_dead_letter_keeps_routing() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        let delivery = queue.receive().await.unwrap().unwrap();
        queue
            .settle(delivery.delivery_tag, Disposition::DeadLetter { reason: "malformed".into() })
            .await
            .unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed");
        assert_eq!(dead[0].original_exchange, "seckill.direct");
        assert_eq!(dead[0].original_routing_key, "seckill.order");
        assert_eq!(dead[0].routing_key, "dlx.order");
        assert_eq!(dead[0].payload_text(), "1");
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_limit_dead_letters() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        for _ in 0..3 {
            let delivery = queue.receive().await.unwrap().unwrap();
            queue.settle(delivery.delivery_tag, Disposition::Redeliver).await.unwrap();
            tokio::time::advance(Duration::from_millis(150)).await;
        }

        assert!(queue.receive().await.unwrap().is_none());
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery_count, 4);
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_deliveries_do_not_spend_attempts() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        for _ in 0..10 {
            let delivery = queue.receive().await.unwrap().unwrap();
            queue.settle(delivery.delivery_tag, Disposition::Defer).await.unwrap();
            assert!(queue.receive().await.unwrap().is_none());
            tokio::time::advance(Duration::from_millis(150)).await;
        }

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_count, 11);
        assert!(delivery.redelivered);
        queue.settle(delivery.delivery_tag, Disposition::Ack).await.unwrap();
        assert!(queue.dead_letters().await.unwrap().is_empty());
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_delivery_reports_limit_dead_letters() {
        let queue = MemoryOrderQueue::new(test_config());
        publish(&queue, "1").await;

        // Taken and abandoned until it runs out of attempts
        for _ in 0..3 {
            queue.receive().await.unwrap().unwrap();
            tokio::time::advance(Duration::from_secs(6)).await;
        }

        let received = queue.next_delivery().await.unwrap();
        assert!(received.delivery.is_none());
        assert_eq!(received.dead_lettered.len(), 1);
        assert_eq!(received.dead_lettered[0].correlation_id, "1");
        assert_eq!(received.dead_lettered[0].reason, "delivery limit exceeded (4 > 3)");
        assert_eq!(queue.dead_letters().await.unwrap(), received.dead_lettered);
        assert!(queue.is_drained());
    }
}
