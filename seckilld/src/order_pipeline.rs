//! Order Pipeline: wires admission and processing to the daemon.
//!
//! The pipeline is responsible for:
//! - Running purchases through admission and recording their outcome
//! - Registering seckill vouchers before a sale
//! - Consuming one delivery at a time: receive, process, settle
//! - Reporting both halves on the event bus and in metrics
//!
//! # Architecture
//!
//! ```text
//! API → OrderPipeline::purchase → SeckillService → OrderQueue
//!                                                     ↓
//! OrderWorker → OrderPipeline::poll_once → OrderProcessor → Store
//!                     ↓
//!             EventBus, Metrics
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use seckill_domain::{OrderId, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use seckill_exec::{
    disposition_for, Admission, DeadLetter, Disposition, FastStore, LockService, OrderProcessor,
    OrderQueue, PublishConfirm, PurchaseError, SeckillCatalog, SeckillService,
};
use seckill_store::Store;

use crate::error::DaemonResult;
use crate::event_bus::{EventBus, PipelineEvent};
use crate::metrics::Metrics;

// =============================================================================
// Backends
// =============================================================================

/// The four stores a pipeline runs against.
#[derive(Clone)]
pub struct Backends {
    /// Durable order and voucher store
    pub store: Arc<dyn Store>,
    /// Admission counters and sets
    pub fast_store: Arc<dyn FastStore>,
    /// Per-user distributed lock
    pub locks: Arc<dyn LockService>,
    /// Order intent queue
    pub queue: Arc<dyn OrderQueue>,
}

// =============================================================================
// Order Pipeline
// =============================================================================

/// Runs both halves of a purchase and reports on them.
pub struct OrderPipeline {
    service: SeckillService,
    catalog: SeckillCatalog,
    processor: OrderProcessor,
    store: Arc<dyn Store>,
    queue: Arc<dyn OrderQueue>,
    event_bus: Arc<EventBus>,
    metrics: Metrics,
}

impl OrderPipeline {
    /// Create a pipeline over the given backends.
    pub fn new(
        backends: Backends,
        lock_ttl: Duration,
        event_bus: Arc<EventBus>,
        metrics: Metrics,
    ) -> Self {
        let Backends { store, fast_store, locks, queue } = backends;

        Self {
            service: SeckillService::new(fast_store.clone(), queue.clone()),
            catalog: SeckillCatalog::new(store.clone(), fast_store),
            processor: OrderProcessor::new(store.clone(), locks, lock_ttl),
            store,
            queue,
            event_bus,
            metrics,
        }
    }

    /// Try to buy one unit of `voucher_id` for `user_id`.
    pub async fn purchase(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<Admission, PurchaseError> {
        let started = Instant::now();
        let result = self.service.purchase(user_id, voucher_id).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(admission) => {
                self.metrics.record_admission("admitted", elapsed);
                self.event_bus.send(PipelineEvent::OrderAdmitted {
                    order_id: admission.order_id,
                    user_id,
                    voucher_id,
                    timestamp: Utc::now(),
                });
                if !admission.confirm.is_ack() {
                    self.report_publish_failure(admission.order_id, &admission.confirm);
                }
            },
            Err(e) => {
                self.metrics.record_admission(e.as_str(), elapsed);
                if let PurchaseError::Unavailable(cause) = e {
                    error!(user_id, voucher_id, %cause, "Purchase failed");
                }
            },
        }

        result
    }

    /// Register a seckill voucher and publish its stock to the fast store.
    pub async fn register_voucher(&self, voucher: &SeckillVoucher) -> DaemonResult<()> {
        self.catalog.add_seckill_voucher(voucher).await?;
        Ok(())
    }

    /// Take one delivery from the queue, process it and settle it.
    ///
    /// Messages the queue dead-letters on the way for running out of
    /// deliveries are reported too. Returns `None` when no delivery was ready.
    pub async fn poll_once(&self) -> DaemonResult<Option<Disposition>> {
        let received = self.queue.next_delivery().await?;
        for letter in &received.dead_lettered {
            self.report_dead_letter(&letter.correlation_id, &letter.reason);
        }
        if !received.dead_lettered.is_empty() {
            self.refresh_dead_letter_depth().await;
        }

        let Some(delivery) = received.delivery else {
            return Ok(None);
        };

        let result = self.processor.process(&delivery).await;
        let disposition = disposition_for(&result);

        debug!(
            delivery_tag = delivery.delivery_tag,
            delivery_count = delivery.delivery_count,
            disposition = disposition.as_str(),
            "Settling delivery"
        );
        self.queue.settle(delivery.delivery_tag, disposition.clone()).await?;

        let timestamp = Utc::now();
        match &result {
            Ok(processed) => {
                self.metrics.record_processed(processed.outcome.as_str());
                self.event_bus.send(PipelineEvent::OrderPersisted {
                    order_id: processed.intent.order_id,
                    user_id: processed.intent.user_id,
                    voucher_id: processed.intent.voucher_id,
                    outcome: processed.outcome,
                    timestamp,
                });
            },
            Err(e) => {
                self.metrics.record_processed(e.as_str());
                match &disposition {
                    Disposition::DeadLetter { reason } => {
                        self.report_dead_letter(&delivery.correlation_id, reason);
                        self.refresh_dead_letter_depth().await;
                    },
                    _ => {
                        warn!(
                            delivery_tag = delivery.delivery_tag,
                            delivery_count = delivery.delivery_count,
                            error = %e,
                            "Delivery left for redelivery"
                        );
                        self.event_bus.send(PipelineEvent::DeliveryRedelivered {
                            delivery_tag: delivery.delivery_tag,
                            correlation_id: delivery.correlation_id.clone(),
                            reason: e.to_string(),
                            timestamp,
                        });
                    },
                }
            },
        }

        Ok(Some(disposition))
    }

    /// Poll until no delivery is ready. Returns the number settled.
    pub async fn drain(&self) -> DaemonResult<usize> {
        let mut settled = 0;
        while self.poll_once().await?.is_some() {
            settled += 1;
        }
        Ok(settled)
    }

    /// Read back a persisted order.
    pub async fn find_order(&self, order_id: OrderId) -> DaemonResult<Option<VoucherOrder>> {
        Ok(self.store.orders().find_by_id(order_id).await?)
    }

    /// Read back a registered voucher.
    pub async fn find_voucher(
        &self,
        voucher_id: VoucherId,
    ) -> DaemonResult<Option<SeckillVoucher>> {
        Ok(self.store.vouchers().find_by_id(voucher_id).await?)
    }

    /// Messages currently on the dead-letter path.
    pub async fn dead_letters(&self) -> DaemonResult<Vec<DeadLetter>> {
        let letters = self.queue.dead_letters().await?;
        self.metrics.set_dead_letter_depth(letters.len());
        Ok(letters)
    }

    /// Metrics for this pipeline.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Event bus this pipeline reports on.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn report_publish_failure(&self, order_id: OrderId, confirm: &PublishConfirm) {
        let label = match confirm {
            PublishConfirm::Ack => return,
            PublishConfirm::Nack { .. } => "nack",
            PublishConfirm::Returned { .. } => "returned",
        };
        self.metrics.record_publish_failure(label);
        self.event_bus.send(PipelineEvent::PublishFailed {
            order_id,
            confirm: confirm.clone(),
            timestamp: Utc::now(),
        });
    }

    fn report_dead_letter(&self, correlation_id: &str, reason: &str) {
        error!(%correlation_id, %reason, "Order intent dead-lettered");
        self.metrics.record_dead_letter();
        self.event_bus.send(PipelineEvent::DeadLettered {
            correlation_id: correlation_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn refresh_dead_letter_depth(&self) {
        match self.queue.dead_letters().await {
            Ok(letters) => self.metrics.set_dead_letter_depth(letters.len()),
            Err(e) => warn!(error = %e, "Failed to read dead-letter depth"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use seckill_exec::{
        order_lock_key, MemoryFastStore, MemoryLockService, MemoryOrderQueue, ProcessOutcome,
        QueueConfig,
    };
    use seckill_store::MemoryStore;

    struct Fixture {
        pipeline: OrderPipeline,
        store: Arc<MemoryStore>,
        locks: Arc<MemoryLockService>,
        queue: Arc<MemoryOrderQueue>,
    }

    fn fixture() -> Fixture {
        fixture_with(QueueConfig { retry_delay: Duration::ZERO, ..QueueConfig::default() })
    }

    fn fixture_with(queue_config: QueueConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(MemoryLockService::new());
        let queue = Arc::new(MemoryOrderQueue::new(queue_config));
        let backends = Backends {
            store: store.clone(),
            fast_store: Arc::new(MemoryFastStore::new()),
            locks: locks.clone(),
            queue: queue.clone(),
        };
        let pipeline = OrderPipeline::new(
            backends,
            Duration::from_secs(30),
            Arc::new(EventBus::new(100)),
            Metrics::new().unwrap(),
        );
        Fixture { pipeline, store, locks, queue }
    }

    fn voucher(voucher_id: VoucherId, stock: i64) -> SeckillVoucher {
        let begin = Utc::now();
        SeckillVoucher::new(voucher_id, stock, begin, begin + ChronoDuration::hours(1)).unwrap()
    }

    #[tokio::test]
    async fn test_purchase_then_poll_persists_order() {
        let f = fixture();
        f.pipeline.register_voucher(&voucher(10, 2)).await.unwrap();
        let mut events = f.pipeline.event_bus().subscribe();

        let admission = f.pipeline.purchase(100, 10).await.unwrap();
        assert!(admission.confirm.is_ack());

        let disposition = f.pipeline.poll_once().await.unwrap();
        assert_eq!(disposition, Some(Disposition::Ack));
        assert!(f.pipeline.poll_once().await.unwrap().is_none());

        let order = f.pipeline.find_order(admission.order_id).await.unwrap().unwrap();
        assert_eq!(order.user_id, 100);
        assert_eq!(f.store.stock_of(10), Some(1));

        assert_eq!(events.try_recv().unwrap().unwrap().event_type(), "order_admitted");
        match events.try_recv().unwrap().unwrap() {
            PipelineEvent::OrderPersisted { order_id, outcome, .. } => {
                assert_eq!(order_id, admission.order_id);
                assert_eq!(outcome, ProcessOutcome::Inserted);
            },
            other => panic!("Expected OrderPersisted, got {:?}", other),
        }

        assert_eq!(f.pipeline.metrics().admissions("admitted"), 1);
        assert_eq!(f.pipeline.metrics().orders_processed("inserted"), 1);
    }

    #[tokio::test]
    async fn test_rejections_are_counted_without_publishing() {
        let f = fixture();
        f.pipeline.register_voucher(&voucher(10, 2)).await.unwrap();

        f.pipeline.purchase(100, 10).await.unwrap();
        let duplicate = f.pipeline.purchase(100, 10).await;
        f.pipeline.purchase(200, 10).await.unwrap();
        let sold_out = f.pipeline.purchase(300, 10).await;

        assert!(matches!(duplicate, Err(PurchaseError::DuplicatePurchase)));
        assert!(matches!(sold_out, Err(PurchaseError::OutOfStock)));
        assert_eq!(f.queue.ready_len(), 2);
        assert_eq!(f.pipeline.metrics().admissions("duplicate_purchase"), 1);
        assert_eq!(f.pipeline.metrics().admissions("out_of_stock"), 1);
    }

    #[tokio::test]
    async fn test_nacked_publish_still_returns_order_id() {
        let f = fixture();
        f.pipeline.register_voucher(&voucher(10, 5)).await.unwrap();
        let mut events = f.pipeline.event_bus().subscribe();
        f.queue.set_nack_next(true);

        let admission = f.pipeline.purchase(100, 10).await.unwrap();

        assert!(!admission.confirm.is_ack());
        assert_eq!(f.queue.ready_len(), 0);
        let _admitted = events.try_recv().unwrap().unwrap();
        assert_eq!(events.try_recv().unwrap().unwrap().event_type(), "publish_failed");
    }

    #[tokio::test]
    async fn test_malformed_delivery_is_dead_lettered() {
        let f = fixture();
        let routing_key = f.queue.topology().routing_key.clone();
        f.queue.publish(&routing_key, b"not json".to_vec(), "x".to_string()).await.unwrap();

        let disposition = f.pipeline.poll_once().await.unwrap();

        assert!(matches!(disposition, Some(Disposition::DeadLetter { .. })));
        let letters = f.pipeline.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].correlation_id, "x");
        assert!(f.pipeline.metrics().gather().unwrap().contains("seckill_dead_letter_depth 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_limit_dead_letters_are_reported() {
        let f = fixture_with(QueueConfig {
            ack_timeout: Duration::from_secs(5),
            max_deliveries: 1,
            ..QueueConfig::default()
        });
        f.pipeline.register_voucher(&voucher(10, 5)).await.unwrap();
        let admission = f.pipeline.purchase(100, 10).await.unwrap();
        let mut events = f.pipeline.event_bus().subscribe();

        // A consumer takes the intent and dies before settling
        f.queue.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(f.pipeline.poll_once().await.unwrap().is_none());

        match events.try_recv().unwrap().unwrap() {
            PipelineEvent::DeadLettered { correlation_id, reason, .. } => {
                assert_eq!(correlation_id, admission.order_id.to_string());
                assert!(reason.starts_with("delivery limit exceeded"));
            },
            other => panic!("Expected DeadLettered, got {:?}", other),
        }
        let text = f.pipeline.metrics().gather().unwrap();
        assert!(text.contains("seckill_dead_letters_total 1"));
        assert!(text.contains("seckill_dead_letter_depth 1"));
        assert_eq!(f.store.order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention_defers_until_lease_expires() {
        let f = fixture_with(QueueConfig::default());
        f.pipeline.register_voucher(&voucher(10, 5)).await.unwrap();
        f.locks
            .try_lock(&order_lock_key(100), uuid::Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();
        let admission = f.pipeline.purchase(100, 10).await.unwrap();

        let mut deferrals = 0;
        loop {
            match f.pipeline.poll_once().await.unwrap() {
                Some(Disposition::Defer) => deferrals += 1,
                Some(Disposition::Ack) => break,
                Some(other) => panic!("Unexpected disposition {:?}", other),
                None => {},
            }
            tokio::time::advance(Duration::from_millis(200)).await;
        }

        assert!(deferrals > QueueConfig::default().max_deliveries as usize);
        assert!(f.pipeline.find_order(admission.order_id).await.unwrap().is_some());
        assert!(f.pipeline.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_counts_settled_deliveries() {
        let f = fixture();
        f.pipeline.register_voucher(&voucher(10, 10)).await.unwrap();
        for user_id in 1..=3 {
            f.pipeline.purchase(user_id, 10).await.unwrap();
        }

        assert_eq!(f.pipeline.drain().await.unwrap(), 3);
        assert_eq!(f.store.order_count(), 3);
        assert!(f.queue.is_drained());
    }
}
