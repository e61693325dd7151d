//! Event bus for pipeline observation.
//!
//! The event bus lets the daemon loop and tests watch the asynchronous half
//! of a purchase without polling stores:
//! - Admission → `OrderAdmitted`, `PublishFailed`
//! - Order workers → `OrderPersisted`, `DeliveryRedelivered`, `DeadLettered`
//!
//! Uses tokio broadcast channels for fan-out to multiple receivers.

use chrono::{DateTime, Utc};
use seckill_domain::{OrderId, UserId, VoucherId};
use seckill_exec::{ProcessOutcome, PublishConfirm};
use tokio::sync::broadcast;

// =============================================================================
// Event Types
// =============================================================================

/// Events that flow through the pipeline event bus.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Admission granted and order id assigned
    OrderAdmitted {
        order_id: OrderId,
        user_id: UserId,
        voucher_id: VoucherId,
        timestamp: DateTime<Utc>,
    },

    /// Admitted intent did not reach the queue
    PublishFailed {
        order_id: OrderId,
        confirm: PublishConfirm,
        timestamp: DateTime<Utc>,
    },

    /// Intent reached a terminal outcome and was acknowledged
    OrderPersisted {
        order_id: OrderId,
        user_id: UserId,
        voucher_id: VoucherId,
        outcome: ProcessOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Delivery left for redelivery
    DeliveryRedelivered {
        delivery_tag: u64,
        correlation_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Delivery rejected to the dead-letter path
    DeadLettered {
        correlation_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::OrderAdmitted { .. } => "order_admitted",
            Self::PublishFailed { .. } => "publish_failed",
            Self::OrderPersisted { .. } => "order_persisted",
            Self::DeliveryRedelivered { .. } => "delivery_redelivered",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
///
/// Multiple producers can send events, and multiple consumers can receive.
/// Uses broadcast channels for fan-out pattern.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Capacity determines how many events can be buffered before
    /// slow receivers start missing events (lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    /// Returns 0 if there are no active receivers.
    pub fn send(&self, event: PipelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events.
    ///
    /// Returns a receiver that will receive all events sent after subscription.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for pipeline events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped.
    /// Returns error description if the receiver lagged (missed events).
    pub async fn recv(&mut self) -> Option<Result<PipelineEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            },
        }
    }

    /// Try to receive an event without blocking.
    ///
    /// Returns `None` if no event is immediately available.
    pub fn try_recv(&mut self) -> Option<Result<PipelineEvent, String>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
