//! Order processor: the asynchronous half of a purchase.
//!
//! Consumes order intents and turns each into exactly one durable order,
//! however many times the intent is delivered.
//!
//! # Flow
//!
//! ```text
//! Delivery → decode → try_lock(lock:order:{userId}) → exists? → Store tx → unlock → Disposition
//! ```
//!
//! The lock cuts down contention between workers. Idempotence rests on the
//! existence check and the uniqueness constraint inside the transaction.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use seckill_domain::{OrderIntent, UserId, VoucherOrder};
use seckill_store::{CreateOrderOutcome, Store};

use crate::error::ExecError;
use crate::ports::{order_lock_key, Delivery, Disposition, LockService};

// =============================================================================
// Outcomes
// =============================================================================

/// Terminal result of processing one intent. Every variant is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Stock decremented and order inserted
    Inserted,
    /// Order already present (duplicate delivery)
    AlreadyExists,
    /// Durable stock ran out before this order
    StockExhausted,
}

impl ProcessOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::AlreadyExists => "already_exists",
            Self::StockExhausted => "stock_exhausted",
        }
    }
}

impl From<CreateOrderOutcome> for ProcessOutcome {
    fn from(outcome: CreateOrderOutcome) -> Self {
        match outcome {
            CreateOrderOutcome::Created => Self::Inserted,
            CreateOrderOutcome::AlreadyExists => Self::AlreadyExists,
            CreateOrderOutcome::StockExhausted => Self::StockExhausted,
        }
    }
}

/// A processed intent and what happened to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    /// Decoded intent
    pub intent: OrderIntent,
    /// Terminal outcome
    pub outcome: ProcessOutcome,
}

/// Reasons a delivery could not be completed.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Another worker holds the user's lock
    #[error("lock contention for user {user_id}")]
    LockContention {
        /// User whose lock was held
        user_id: UserId,
    },

    /// Store or lock unreachable; may succeed on redelivery
    #[error("transient failure: {0}")]
    Transient(ExecError),

    /// Malformed or permanently invalid intent
    #[error("poison message: {0}")]
    Poison(String),
}

impl ProcessError {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockContention { .. } => "lock_contention",
            Self::Transient(_) => "transient_failure",
            Self::Poison(_) => "poison_message",
        }
    }

    fn classify(err: ExecError) -> Self {
        if err.is_retryable() {
            Self::Transient(err)
        } else {
            Self::Poison(err.to_string())
        }
    }
}

/// How to settle a delivery given its processing result.
pub fn disposition_for(result: &Result<Processed, ProcessError>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        // Leases expire, so contention always ends
        Err(ProcessError::LockContention { .. }) => Disposition::Defer,
        Err(ProcessError::Transient(_)) => Disposition::Redeliver,
        Err(ProcessError::Poison(reason)) => Disposition::DeadLetter { reason: reason.clone() },
    }
}

// =============================================================================
// Order Processor
// =============================================================================

/// Persists order intents under a per-user distributed lock.
pub struct OrderProcessor {
    store: Arc<dyn Store>,
    locks: Arc<dyn LockService>,
    lock_ttl: Duration,
}

impl OrderProcessor {
    /// Create a processor whose locks expire after `lock_ttl`.
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockService>, lock_ttl: Duration) -> Self {
        Self { store, locks, lock_ttl }
    }

    /// Process one delivery.
    pub async fn process(&self, delivery: &Delivery) -> Result<Processed, ProcessError> {
        let intent = OrderIntent::from_payload(&delivery.payload).map_err(|e| {
            error!(
                delivery_tag = delivery.delivery_tag,
                correlation_id = %delivery.correlation_id,
                error = %e,
                "Undecodable order intent"
            );
            ProcessError::Poison(e.to_string())
        })?;

        self.process_intent(intent).await
    }

    /// Process one decoded intent.
    pub async fn process_intent(&self, intent: OrderIntent) -> Result<Processed, ProcessError> {
        let key = order_lock_key(intent.user_id);
        let owner = Uuid::new_v4();

        let acquired = self
            .locks
            .try_lock(&key, owner, self.lock_ttl)
            .await
            .map_err(ProcessError::Transient)?;
        if !acquired {
            warn!(
                order_id = intent.order_id,
                user_id = intent.user_id,
                "User lock held elsewhere, leaving delivery for redelivery"
            );
            return Err(ProcessError::LockContention { user_id: intent.user_id });
        }

        let result = self.persist(&intent).await;

        match self.locks.unlock(&key, owner).await {
            Ok(true) => {},
            Ok(false) => warn!(%key, "Lock lease expired before release"),
            Err(e) => warn!(%key, error = %e, "Failed to release lock, leaving it to expire"),
        }

        result.map(|outcome| Processed { intent, outcome })
    }

    async fn persist(&self, intent: &OrderIntent) -> Result<ProcessOutcome, ProcessError> {
        let exists = self
            .store
            .orders()
            .exists(intent.user_id, intent.voucher_id)
            .await
            .map_err(|e| ProcessError::classify(e.into()))?;
        if exists {
            debug!(
                order_id = intent.order_id,
                user_id = intent.user_id,
                voucher_id = intent.voucher_id,
                "Order already persisted, acknowledging duplicate delivery"
            );
            return Ok(ProcessOutcome::AlreadyExists);
        }

        let order = VoucherOrder::from_intent(intent);
        let outcome: ProcessOutcome = self
            .store
            .create_voucher_order(&order)
            .await
            .map_err(|e| {
                let err = ProcessError::classify(e.into());
                error!(order_id = intent.order_id, error = %err, "Order transaction failed");
                err
            })?
            .into();

        match outcome {
            ProcessOutcome::Inserted => info!(
                order_id = intent.order_id,
                user_id = intent.user_id,
                voucher_id = intent.voucher_id,
                "Order persisted"
            ),
            ProcessOutcome::StockExhausted => warn!(
                order_id = intent.order_id,
                voucher_id = intent.voucher_id,
                "Durable stock exhausted, dropping order"
            ),
            ProcessOutcome::AlreadyExists => debug!(
                order_id = intent.order_id,
                "Order inserted concurrently, decrement rolled back"
            ),
        }

        Ok(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================
