//! Domain Entities for the flash sale pipeline
//!
//! Vouchers on sale, order intents travelling through the queue, and the
//! durable order records they become.

use crate::value_objects::{DomainError, OrderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a voucher
pub type VoucherId = u64;

/// Unique identifier for an authenticated user
pub type UserId = u64;

/// Unique identifier for an order (produced by the ID generator)
pub type OrderId = u64;

// =============================================================================
// Seckill Voucher
// =============================================================================

/// A voucher put on flash sale with limited stock.
///
/// The durable store owns `stock`; the fast store holds a mirror used
/// only for admission checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeckillVoucher {
    pub voucher_id: VoucherId,
    /// Remaining units. Never negative.
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SeckillVoucher {
    /// Create a voucher definition, validating stock and sale window.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidVoucher` if stock is negative, the id is
    /// zero, or the window ends before it begins.
    pub fn new(
        voucher_id: VoucherId,
        stock: i64,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if voucher_id == 0 {
            return Err(DomainError::InvalidVoucher("voucher_id must be non-zero".to_string()));
        }
        if stock < 0 {
            return Err(DomainError::InvalidVoucher(format!("negative stock: {}", stock)));
        }
        if end_time <= begin_time {
            return Err(DomainError::InvalidVoucher(
                "sale window must end after it begins".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            voucher_id,
            stock,
            begin_time,
            end_time,
            created_at: now,
            updated_at: now,
        })
    }

    /// Check if any units remain.
    pub fn has_stock(&self) -> bool {
        self.stock > 0
    }
}

// =============================================================================
// Order Intent
// =============================================================================

/// A granted-but-not-yet-persisted purchase.
///
/// Created once per successful admission and carried by the order queue.
/// Delivery is at-least-once, so consumers must treat it idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderIntent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
}

impl OrderIntent {
    /// Create a new intent.
    pub fn new(order_id: OrderId, user_id: UserId, voucher_id: VoucherId) -> Self {
        Self { order_id, user_id, voucher_id }
    }

    /// Reject intents that can never be persisted.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidIntent` naming the first zero field.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.order_id == 0 {
            return Err(DomainError::InvalidIntent("orderId is zero".to_string()));
        }
        if self.user_id == 0 {
            return Err(DomainError::InvalidIntent("userId is zero".to_string()));
        }
        if self.voucher_id == 0 {
            return Err(DomainError::InvalidIntent("voucherId is zero".to_string()));
        }
        Ok(())
    }

    /// Decode an intent from a queue payload and validate it.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidIntent` if the bytes are not a valid intent.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DomainError> {
        let intent: Self = serde_json::from_slice(payload)
            .map_err(|e| DomainError::InvalidIntent(format!("undecodable payload: {}", e)))?;
        intent.validate()?;
        Ok(intent)
    }

    /// Encode as a queue payload.
    pub fn to_payload(&self) -> Vec<u8> {
        // Three integer fields cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

// =============================================================================
// Voucher Order
// =============================================================================

/// Durable order record.
///
/// At most one exists per `(user_id, voucher_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl VoucherOrder {
    /// Materialize the order record for an intent.
    pub fn from_intent(intent: &OrderIntent) -> Self {
        Self {
            id: intent.order_id,
            user_id: intent.user_id,
            voucher_id: intent.voucher_id,
            status: OrderStatus::Unpaid,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
