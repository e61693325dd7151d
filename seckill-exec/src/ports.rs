//! Execution layer port definitions.
//!
//! Ports define the interfaces for the shared infrastructure the pipeline
//! uses: the fast store, the distributed lock, and the order queue.
//! Adapters implement these ports (in-memory, PostgreSQL).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use seckill_domain::{AdmissionOutcome, OrderId, UserId, VoucherId};

use crate::error::ExecError;

// =============================================================================
// Fast Store Port
// =============================================================================

/// Port for the low-latency shared store used by admission and id generation.
///
/// Implementations:
/// - `MemoryFastStore` - Single process, one critical section per script
/// - `PgFastStore` - Row-locking fallback for stores without scripting
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Run the admission script as one indivisible step.
    ///
    /// Checks stock, then purchase-set membership, then decrements stock and
    /// records the user. Only `Admitted` mutates state.
    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<AdmissionOutcome, ExecError>;

    /// Publish a voucher's stock into the mirror counter.
    async fn load_stock(&self, voucher_id: VoucherId, stock: i64) -> Result<(), ExecError>;

    /// Current mirror stock (`None` if never loaded).
    async fn stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, ExecError>;

    /// Whether the user is in the voucher's purchase set.
    async fn is_member(&self, voucher_id: VoucherId, user_id: UserId) -> Result<bool, ExecError>;

    /// Atomically increment a counter and return the new value.
    async fn increment(&self, key: &str) -> Result<u64, ExecError>;
}

/// Fast-store key of a voucher's stock counter.
pub fn stock_key(voucher_id: VoucherId) -> String {
    format!("seckill:stock:{}", voucher_id)
}

/// Fast-store key of a voucher's purchase set.
pub fn order_set_key(voucher_id: VoucherId) -> String {
    format!("seckill:order:{}", voucher_id)
}

// =============================================================================
// Lock Port
// =============================================================================

/// Port for the cross-process mutual-exclusion primitive.
///
/// Every lock carries a lease; an expired lease is treated as released.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try once to take `key` for `owner`. Never waits.
    async fn try_lock(&self, key: &str, owner: Uuid, ttl: Duration) -> Result<bool, ExecError>;

    /// Release `key` if `owner` still holds it. Returns whether it did.
    async fn unlock(&self, key: &str, owner: Uuid) -> Result<bool, ExecError>;
}

/// Lock key serializing order creation for one user.
pub fn order_lock_key(user_id: UserId) -> String {
    format!("lock:order:{}", user_id)
}

// =============================================================================
// Order Queue Port
// =============================================================================

/// Port for the durable at-least-once order queue.
///
/// Implementations:
/// - `MemoryOrderQueue` - In-process queue with ack timeout and dead letters
/// - `PgOrderQueue` - Table-backed queue leased with `SKIP LOCKED`
#[async_trait]
pub trait OrderQueue: Send + Sync {
    /// Publish a message to the work exchange and wait for its confirm.
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        correlation_id: String,
    ) -> Result<PublishConfirm, ExecError>;

    /// Take the next visible message, if any, along with every message the
    /// queue dead-lettered on the way for exceeding `max_deliveries`.
    ///
    /// The delivery stays unacknowledged until settled; if not settled within
    /// the ack timeout it becomes visible again.
    async fn next_delivery(&self) -> Result<Received, ExecError>;

    /// Take the next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, ExecError> {
        Ok(self.next_delivery().await?.delivery)
    }

    /// Settle a delivery.
    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), ExecError>;

    /// Messages on the dead-letter queue, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ExecError>;

    /// Queue names and routing keys.
    fn topology(&self) -> &QueueTopology;
}

/// Named topology of the work and dead-letter paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTopology {
    /// Work exchange
    pub exchange: String,
    /// Work queue
    pub queue: String,
    /// Routing key binding the work queue
    pub routing_key: String,
    /// Dead-letter exchange
    pub dead_letter_exchange: String,
    /// Dead-letter queue
    pub dead_letter_queue: String,
    /// Routing key binding the dead-letter queue
    pub dead_letter_routing_key: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            exchange: "seckill.direct".to_string(),
            queue: "seckill.queue".to_string(),
            routing_key: "seckill.order".to_string(),
            dead_letter_exchange: "dlx.direct".to_string(),
            dead_letter_queue: "dlx.queue".to_string(),
            dead_letter_routing_key: "dlx.order".to_string(),
        }
    }
}

/// Broker answer to a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishConfirm {
    /// Message durably accepted and routed
    Ack,
    /// Broker refused the message
    Nack {
        /// Broker-supplied cause
        cause: String,
    },
    /// Accepted by the exchange but no queue is bound to the routing key
    Returned {
        /// Broker-supplied reply text
        reply_text: String,
    },
}

impl PublishConfirm {
    /// Whether the message reached a queue.
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag identifying this delivery attempt (used to settle)
    pub delivery_tag: u64,
    /// How many times the message has been delivered, including this one
    pub delivery_count: u32,
    /// Whether an earlier delivery of this message went unsettled or was rejected
    pub redelivered: bool,
    /// Publisher correlation id (the order id)
    pub correlation_id: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Raw JSON body
    pub payload: Vec<u8>,
}

/// Outcome of one [`OrderQueue::next_delivery`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// Delivery handed to the consumer
    pub delivery: Option<Delivery>,
    /// Messages that ran out of deliveries before one could be handed out
    pub dead_lettered: Vec<DeadLetter>,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done; remove the message
    Ack,
    /// Not done; make the message visible again after the retry delay
    Redeliver,
    /// Someone else holds the work; retry after the retry delay without
    /// spending one of the message's `max_deliveries`
    Defer,
    /// Never retry; move the message to the dead-letter path
    DeadLetter {
        /// Why the consumer gave up
        reason: String,
    },
}

impl Disposition {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Redeliver => "redeliver",
            Self::Defer => "defer",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// A message on the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Publisher correlation id
    pub correlation_id: String,
    /// Exchange the message was originally published to
    pub original_exchange: String,
    /// Routing key the message was originally published with
    pub original_routing_key: String,
    /// Dead-letter routing key it was re-routed with
    pub routing_key: String,
    /// Raw JSON body
    pub payload: Vec<u8>,
    /// Why the message was dead-lettered
    pub reason: String,
    /// Deliveries before it was dead-lettered
    pub delivery_count: u32,
    /// When it was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Payload as text, for operator inspection.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// =============================================================================
// Tests
// =============================================================================
