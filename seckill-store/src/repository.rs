//! Repository trait definitions (Ports)
//!
//! These traits define the durable storage interface for the order pipeline.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.

use crate::error::StoreError;
use async_trait::async_trait;
use seckill_domain::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};

/// Repository for seckill voucher stock records
#[async_trait]
pub trait VoucherRepository: Send + Sync {
    /// Save a voucher (insert or replace its definition and stock)
    async fn save(&self, voucher: &SeckillVoucher) -> Result<(), StoreError>;

    /// Find a voucher by ID
    async fn find_by_id(&self, id: VoucherId) -> Result<Option<SeckillVoucher>, StoreError>;
}

/// Repository for durable voucher orders (read side)
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Find an order by ID
    async fn find_by_id(&self, id: OrderId) -> Result<Option<VoucherOrder>, StoreError>;

    /// Count orders for a `(user, voucher)` pair (0 or 1 under the invariant)
    async fn count_by_user_and_voucher(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<u64, StoreError>;

    /// Check whether the user already holds an order for the voucher
    async fn exists(&self, user_id: UserId, voucher_id: VoucherId) -> Result<bool, StoreError> {
        Ok(self.count_by_user_and_voucher(user_id, voucher_id).await? > 0)
    }
}

/// Outcome of the transactional order write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOrderOutcome {
    /// Stock decremented and order inserted
    Created,
    /// An order for `(user, voucher)` already existed; nothing changed
    AlreadyExists,
    /// Durable stock was already zero; nothing changed
    StockExhausted,
}

impl CreateOrderOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AlreadyExists => "already_exists",
            Self::StockExhausted => "stock_exhausted",
        }
    }
}

/// Combined store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Get voucher repository
    fn vouchers(&self) -> &dyn VoucherRepository;

    /// Get order repository
    fn orders(&self) -> &dyn OrderRepository;

    /// Decrement stock (conditioned on stock > 0) and insert the order,
    /// as one atomic transaction.
    ///
    /// The `(user_id, voucher_id)` uniqueness is re-checked inside the
    /// transaction; a violation rolls back the decrement. A failure at any
    /// point leaves neither the decrement nor the insert visible.
    async fn create_voucher_order(
        &self,
        order: &VoucherOrder,
    ) -> Result<CreateOrderOutcome, StoreError>;
}
