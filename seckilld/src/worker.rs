//! Order worker: consumes order intents until shutdown.
//!
//! Each worker drains every ready delivery on a tick, then sleeps until the
//! next tick. Deliveries left unsettled at shutdown are redelivered by the
//! queue once their ack timeout passes.

use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use seckill_exec::Disposition;

use crate::error::DaemonResult;
use crate::order_pipeline::OrderPipeline;

/// One consumer of the order queue.
pub struct OrderWorker {
    id: usize,
    pipeline: Arc<OrderPipeline>,
    poll_interval: Duration,
}

impl OrderWorker {
    /// Create a worker that polls every `poll_interval` while idle.
    pub fn new(id: usize, pipeline: Arc<OrderPipeline>, poll_interval: Duration) -> Self {
        Self { id, pipeline, poll_interval }
    }

    /// Run the worker loop.
    ///
    /// Returns when shutdown is signaled via cancellation token.
    pub async fn run(self, shutdown: CancellationToken) -> DaemonResult<()> {
        info!(
            worker = self.id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Order worker started"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker = self.id, "Order worker shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll_batch(&shutdown).await {
                        Ok(count) if count > 0 => {
                            debug!(worker = self.id, count, "Settled deliveries");
                        }
                        Err(e) => {
                            error!(worker = self.id, error = %e, "Order worker error (will retry)");
                        }
                        _ => {}
                    }
                }
            }
        }

        info!(worker = self.id, "Order worker stopped");
        Ok(())
    }

    /// Settle ready deliveries until the queue is empty or shutdown starts.
    ///
    /// A delivery sent back for retry ends the batch; it is picked up again on
    /// a later tick.
    async fn poll_batch(&self, shutdown: &CancellationToken) -> DaemonResult<usize> {
        let mut settled = 0;
        while !shutdown.is_cancelled() {
            match self.pipeline.poll_once().await? {
                None => break,
                Some(Disposition::Redeliver) | Some(Disposition::Defer) => {
                    settled += 1;
                    break;
                },
                Some(_) => settled += 1,
            }
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{EventBus, PipelineEvent};
    use crate::metrics::Metrics;
    use crate::order_pipeline::Backends;
    use chrono::{Duration as ChronoDuration, Utc};
    use seckill_domain::SeckillVoucher;
    use seckill_exec::{MemoryFastStore, MemoryLockService, MemoryOrderQueue};
    use seckill_store::MemoryStore;

    #[tokio::test]
    async fn test_worker_persists_orders_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            store: store.clone(),
            fast_store: Arc::new(MemoryFastStore::new()),
            locks: Arc::new(MemoryLockService::new()),
            queue: Arc::new(MemoryOrderQueue::default()),
        };
        let pipeline = Arc::new(OrderPipeline::new(
            backends,
            Duration::from_secs(30),
            Arc::new(EventBus::new(100)),
            Metrics::new().unwrap(),
        ));
        let begin = Utc::now();
        let voucher = SeckillVoucher::new(1, 5, begin, begin + ChronoDuration::hours(1)).unwrap();
        pipeline.register_voucher(&voucher).await.unwrap();
        let mut events = pipeline.event_bus().subscribe();

        let shutdown = CancellationToken::new();
        let worker = OrderWorker::new(0, pipeline.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let admission = pipeline.purchase(42, 1).await.unwrap();

        let persisted = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Ok(PipelineEvent::OrderPersisted { order_id, .. })) =
                    events.recv().await
                {
                    return order_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(persisted, admission.order_id);
        assert_eq!(store.order_count(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
