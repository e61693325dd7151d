//! In-memory pipeline wiring for scenario tests.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use seckill_domain::{SeckillVoucher, VoucherId};
use seckill_exec::{
    disposition_for, MemoryFastStore, MemoryLockService, MemoryOrderQueue, OrderProcessor,
    OrderQueue, ProcessError, Processed, QueueConfig, SeckillCatalog, SeckillService,
};
use seckill_store::MemoryStore;

use crate::Result;

/// Every component of the pipeline, backed by in-memory adapters.
///
/// Handles to the concrete adapters are kept so tests can inject faults and
/// inspect state.
pub struct MemoryPipeline {
    /// Durable store
    pub store: Arc<MemoryStore>,
    /// Fast store
    pub fast_store: Arc<MemoryFastStore>,
    /// Lock service
    pub locks: Arc<MemoryLockService>,
    /// Order queue
    pub queue: Arc<MemoryOrderQueue>,
    /// Admission path
    pub service: SeckillService,
    /// Voucher registration
    pub catalog: SeckillCatalog,
    /// Processing path
    pub processor: OrderProcessor,
}

impl MemoryPipeline {
    /// Wire a pipeline with the given queue policy and lock lease.
    pub fn new(queue_config: QueueConfig, lock_ttl: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let fast_store = Arc::new(MemoryFastStore::new());
        let locks = Arc::new(MemoryLockService::new());
        let queue = Arc::new(MemoryOrderQueue::new(queue_config));

        let service = SeckillService::new(fast_store.clone(), queue.clone());
        let catalog = SeckillCatalog::new(store.clone(), fast_store.clone());
        let processor = OrderProcessor::new(store.clone(), locks.clone(), lock_ttl);

        Self { store, fast_store, locks, queue, service, catalog, processor }
    }

    /// Register a voucher on sale for the next hour.
    pub async fn add_voucher(&self, voucher_id: VoucherId, stock: i64) -> Result<SeckillVoucher> {
        let begin = Utc::now();
        let voucher = SeckillVoucher::new(voucher_id, stock, begin, begin + ChronoDuration::hours(1))?;
        self.catalog.add_seckill_voucher(&voucher).await?;
        Ok(voucher)
    }

    /// Receive, process and settle one delivery. `None` if nothing was visible.
    pub async fn process_next(&self) -> Result<Option<std::result::Result<Processed, ProcessError>>> {
        let Some(delivery) = self.queue.receive().await? else {
            return Ok(None);
        };

        let result = self.processor.process(&delivery).await;
        let disposition = disposition_for(&result);
        debug!(delivery_tag = delivery.delivery_tag, disposition = disposition.as_str(), "Test settle");
        self.queue.settle(delivery.delivery_tag, disposition).await?;
        Ok(Some(result))
    }

    /// Process until no delivery is visible. Returns every result in order.
    ///
    /// With a zero retry delay a deferred delivery is visible again at once,
    /// so drain only while no foreign lock is held.
    pub async fn drain(&self) -> Result<Vec<std::result::Result<Processed, ProcessError>>> {
        let mut results = Vec::new();
        while let Some(result) = self.process_next().await? {
            results.push(result);
        }
        Ok(results)
    }
}

impl Default for MemoryPipeline {
    fn default() -> Self {
        let config = QueueConfig {
            retry_delay: Duration::ZERO,
            ..QueueConfig::default()
        };
        Self::new(config, Duration::from_secs(30))
    }
}
