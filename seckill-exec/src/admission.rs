//! Admission path: the synchronous half of a purchase.
//!
//! # Flow
//!
//! ```text
//! purchase → IdWorker → FastStore::admit → OrderQueue::publish → order id
//! ```
//!
//! Only admitted purchases reach the queue. A publish that is not confirmed
//! after a successful admission is logged and reported, never retried here.

use std::sync::Arc;
use tracing::{debug, error, info};

use seckill_domain::{AdmissionOutcome, OrderId, OrderIntent, SeckillVoucher, UserId, VoucherId};
use seckill_store::Store;

use crate::error::{ExecResult, PurchaseError};
use crate::id_worker::IdWorker;
use crate::ports::{FastStore, OrderQueue, PublishConfirm};

/// Business key for order ids.
pub const ORDER_ID_KEY: &str = "order";

// =============================================================================
// Admission Result
// =============================================================================

/// A granted purchase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Id assigned to the order
    pub order_id: OrderId,
    /// What the broker said about the order intent
    pub confirm: PublishConfirm,
}

// =============================================================================
// Seckill Service
// =============================================================================

/// Runs the admission script and hands admitted intents to the queue.
pub struct SeckillService {
    fast_store: Arc<dyn FastStore>,
    queue: Arc<dyn OrderQueue>,
    ids: IdWorker,
}

impl SeckillService {
    /// Create a new admission service.
    pub fn new(fast_store: Arc<dyn FastStore>, queue: Arc<dyn OrderQueue>) -> Self {
        let ids = IdWorker::new(fast_store.clone());
        Self { fast_store, queue, ids }
    }

    /// Try to buy one unit of `voucher_id` for `user_id`.
    ///
    /// Returns the order id on admission. Durable persistence happens
    /// asynchronously.
    pub async fn purchase(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<Admission, PurchaseError> {
        let order_id = self.ids.next_id(ORDER_ID_KEY).await?;

        let outcome = self.fast_store.admit(voucher_id, user_id, order_id).await?;
        debug!(user_id, voucher_id, order_id, outcome = outcome.as_str(), "Admission evaluated");

        match outcome {
            AdmissionOutcome::SoldOut => return Err(PurchaseError::OutOfStock),
            AdmissionOutcome::DuplicateUser => return Err(PurchaseError::DuplicatePurchase),
            AdmissionOutcome::Admitted => {},
        }

        let intent = OrderIntent::new(order_id, user_id, voucher_id);
        let confirm = self.publish(&intent).await;

        Ok(Admission { order_id, confirm })
    }

    async fn publish(&self, intent: &OrderIntent) -> PublishConfirm {
        let routing_key = self.queue.topology().routing_key.clone();
        let confirm = match self
            .queue
            .publish(&routing_key, intent.to_payload(), intent.order_id.to_string())
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => PublishConfirm::Nack { cause: e.to_string() },
        };

        match &confirm {
            PublishConfirm::Ack => {
                debug!(order_id = intent.order_id, "Order intent confirmed by broker");
            },
            PublishConfirm::Nack { cause } => {
                error!(
                    order_id = intent.order_id,
                    user_id = intent.user_id,
                    voucher_id = intent.voucher_id,
                    %cause,
                    "Order intent publish failed"
                );
            },
            PublishConfirm::Returned { reply_text } => {
                error!(
                    order_id = intent.order_id,
                    %routing_key,
                    %reply_text,
                    "Order intent returned unroutable"
                );
            },
        }

        confirm
    }
}

// =============================================================================
// Seckill Catalog
// =============================================================================

/// Registers seckill vouchers ahead of a sale.
pub struct SeckillCatalog {
    store: Arc<dyn Store>,
    fast_store: Arc<dyn FastStore>,
}

impl SeckillCatalog {
    /// Create a new catalog.
    pub fn new(store: Arc<dyn Store>, fast_store: Arc<dyn FastStore>) -> Self {
        Self { store, fast_store }
    }

    /// Persist a voucher and mirror its stock into the fast store.
    pub async fn add_seckill_voucher(&self, voucher: &SeckillVoucher) -> ExecResult<()> {
        self.store.vouchers().save(voucher).await?;
        self.fast_store.load_stock(voucher.voucher_id, voucher.stock).await?;

        info!(
            voucher_id = voucher.voucher_id,
            stock = voucher.stock,
            begin = %voucher.begin_time,
            end = %voucher.end_time,
            "Seckill voucher registered"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
