//! End-to-end scenarios for the order pipeline on in-memory adapters.
//!
//! Covers oversell and duplicate-purchase races, idempotent processing under
//! redelivery, crash recovery between decrement and insert, lock contention,
//! ack-timeout redelivery and dead-lettering.
//!
//! Run with: `cargo test -p seckilld --test pipeline_scenarios`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use seckill_domain::OrderIntent;
use seckill_exec::{
    order_lock_key, LockService, OrderQueue, ProcessError, ProcessOutcome, PurchaseError,
    QueueConfig,
};
use seckill_store::Store;
use seckill_testkit::MemoryPipeline;
use seckilld::{Config, Daemon, PipelineEvent};
use uuid::Uuid;

// =============================================================================
// Admission races
// =============================================================================

/// Stock 1, two users racing: exactly one order id, one "out of stock".
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_unit_goes_to_exactly_one_user() {
    let pipeline = Arc::new(MemoryPipeline::default());
    pipeline.add_voucher(1, 1).await.unwrap();

    let a = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.service.purchase(100, 1).await }
    });
    let b = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.service.purchase(200, 1).await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let sold_out =
        results.iter().filter(|r| matches!(r, Err(PurchaseError::OutOfStock))).count();
    assert_eq!(admitted, 1);
    assert_eq!(sold_out, 1);

    pipeline.drain().await.unwrap();
    assert_eq!(pipeline.store.order_count(), 1);
    assert_eq!(pipeline.store.stock_of(1), Some(0));
}

/// Same user twice in quick succession: order id, then "duplicate purchase".
#[tokio::test]
async fn test_same_user_cannot_buy_twice() {
    let pipeline = MemoryPipeline::default();
    pipeline.add_voucher(1, 10).await.unwrap();

    let first = pipeline.service.purchase(100, 1).await;
    let second = pipeline.service.purchase(100, 1).await;

    assert!(first.is_ok());
    assert!(matches!(second, Err(PurchaseError::DuplicatePurchase)));
    assert_eq!(pipeline.queue.ready_len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_burst_never_oversells() {
    const STOCK: i64 = 50;
    const USERS: u64 = 400;

    let pipeline = Arc::new(MemoryPipeline::default());
    pipeline.add_voucher(1, STOCK).await.unwrap();

    let handles: Vec<_> = (1..=USERS)
        .map(|user_id| {
            let pipeline = pipeline.clone();
            // Every user tries twice
            tokio::spawn(async move {
                let first = pipeline.service.purchase(user_id, 1).await;
                let second = pipeline.service.purchase(user_id, 1).await;
                (first, second)
            })
        })
        .collect();

    let mut order_ids = HashSet::new();
    for handle in handles {
        let (first, second) = handle.await.unwrap();
        assert!(!(first.is_ok() && second.is_ok()), "user admitted twice");
        for admission in [first, second].into_iter().flatten() {
            assert!(order_ids.insert(admission.order_id), "order id reused");
        }
    }
    assert_eq!(order_ids.len() as i64, STOCK);

    let results = pipeline.drain().await.unwrap();
    assert_eq!(results.len() as i64, STOCK);
    assert_eq!(pipeline.store.order_count() as i64, STOCK);
    assert_eq!(pipeline.store.stock_of(1), Some(0));
}

#[tokio::test]
async fn test_order_ids_increase_across_purchases() {
    let pipeline = MemoryPipeline::default();
    pipeline.add_voucher(1, 100).await.unwrap();

    let mut previous = 0;
    for user_id in 1..=20 {
        let order_id = pipeline.service.purchase(user_id, 1).await.unwrap().order_id;
        assert!(order_id > previous);
        previous = order_id;
    }
}

// =============================================================================
// Processing
// =============================================================================

#[tokio::test]
async fn test_duplicate_delivery_yields_one_order() {
    let pipeline = MemoryPipeline::default();
    pipeline.add_voucher(1, 5).await.unwrap();
    let admission = pipeline.service.purchase(100, 1).await.unwrap();

    // Broker delivers the same intent again
    let intent = OrderIntent::new(admission.order_id, 100, 1);
    let routing_key = pipeline.queue.topology().routing_key.clone();
    pipeline
        .queue
        .publish(&routing_key, intent.to_payload(), admission.order_id.to_string())
        .await
        .unwrap();

    let results = pipeline.drain().await.unwrap();
    let outcomes: Vec<_> = results.into_iter().map(|r| r.unwrap().outcome).collect();

    assert_eq!(outcomes, vec![ProcessOutcome::Inserted, ProcessOutcome::AlreadyExists]);
    assert_eq!(pipeline.store.order_count(), 1);
    assert_eq!(pipeline.store.stock_of(1), Some(4));
}

/// Crash after the decrement, before the insert and the ack: the redelivery
/// re-runs the whole transaction once.
#[tokio::test]
async fn test_crash_before_insert_recovers_without_double_decrement() {
    let pipeline = MemoryPipeline::default();
    pipeline.add_voucher(1, 5).await.unwrap();
    pipeline.service.purchase(100, 1).await.unwrap();
    pipeline.store.set_crash_after_decrement(true);

    let results = pipeline.drain().await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(ProcessError::Transient(_))));
    assert_eq!(results[1].as_ref().unwrap().outcome, ProcessOutcome::Inserted);
    assert_eq!(pipeline.store.order_count(), 1);
    assert_eq!(pipeline.store.stock_of(1), Some(4));
    assert_eq!(pipeline.store.decrement_count(), 1);
    assert!(!pipeline.locks.is_locked(&order_lock_key(100)));
}

/// A stuck worker holds user U's lock: the delivery is deferred and succeeds
/// once the lease expires.
#[tokio::test(start_paused = true)]
async fn test_stuck_lock_holder_delays_but_does_not_lose_order() {
    let pipeline = MemoryPipeline::default();
    pipeline.add_voucher(1, 5).await.unwrap();
    pipeline
        .locks
        .try_lock(&order_lock_key(100), Uuid::new_v4(), Duration::from_secs(10))
        .await
        .unwrap();
    pipeline.service.purchase(100, 1).await.unwrap();

    let blocked = pipeline.process_next().await.unwrap().unwrap();
    assert!(matches!(blocked, Err(ProcessError::LockContention { user_id: 100 })));
    assert_eq!(pipeline.store.order_count(), 0);

    tokio::time::advance(Duration::from_secs(11)).await;

    let done = pipeline.process_next().await.unwrap().unwrap();
    assert_eq!(done.unwrap().outcome, ProcessOutcome::Inserted);
    assert_eq!(pipeline.store.order_count(), 1);
    assert!(pipeline.queue.is_drained());
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_delivery_is_redelivered() {
    let config = QueueConfig {
        ack_timeout: Duration::from_secs(5),
        retry_delay: Duration::ZERO,
        ..QueueConfig::default()
    };
    let pipeline = MemoryPipeline::new(config, Duration::from_secs(30));
    pipeline.add_voucher(1, 5).await.unwrap();
    pipeline.service.purchase(100, 1).await.unwrap();

    // Consumer takes the message and dies without settling
    let first = pipeline.queue.receive().await.unwrap().unwrap();
    assert!(!first.redelivered);
    assert!(pipeline.queue.receive().await.unwrap().is_none());

    tokio::time::advance(Duration::from_secs(6)).await;

    let second = pipeline.queue.receive().await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.delivery_count, 2);
    assert_eq!(second.payload, first.payload);
}

/// Shipped queue policy and lease: a lock stuck for the full 30s lease
/// outlasts every retry budget, yet the order is written once it expires.
#[tokio::test(start_paused = true)]
async fn test_default_policy_outlasts_stuck_lock() {
    let pipeline = MemoryPipeline::new(QueueConfig::default(), Duration::from_secs(30));
    pipeline.add_voucher(1, 5).await.unwrap();
    pipeline
        .locks
        .try_lock(&order_lock_key(100), Uuid::new_v4(), Duration::from_secs(30))
        .await
        .unwrap();
    let admission = pipeline.service.purchase(100, 1).await.unwrap();

    let mut contended = 0;
    let mut inserted = false;
    for _ in 0..200 {
        match pipeline.process_next().await.unwrap() {
            Some(Err(ProcessError::LockContention { user_id: 100 })) => contended += 1,
            Some(Ok(processed)) => {
                assert_eq!(processed.outcome, ProcessOutcome::Inserted);
                inserted = true;
                break;
            },
            Some(Err(other)) => panic!("Unexpected failure: {}", other),
            None => {},
        }
        tokio::time::advance(Duration::from_millis(200)).await;
    }

    assert!(inserted);
    assert!(contended > QueueConfig::default().max_deliveries as usize);
    assert_eq!(pipeline.store.order_count(), 1);
    let order = pipeline.store.orders().find_by_id(admission.order_id).await.unwrap();
    assert_eq!(order.map(|o| o.user_id), Some(100));
    assert!(pipeline.queue.dead_letters().await.unwrap().is_empty());
    assert!(pipeline.queue.is_drained());
}

/// Consumers that keep dying before settling exhaust the delivery limit; the
/// queue reports the message it dead-letters.
#[tokio::test(start_paused = true)]
async fn test_abandoned_delivery_ends_on_dead_letter_path() {
    let config = QueueConfig {
        ack_timeout: Duration::from_secs(5),
        max_deliveries: 2,
        ..QueueConfig::default()
    };
    let pipeline = MemoryPipeline::new(config, Duration::from_secs(30));
    pipeline.add_voucher(1, 5).await.unwrap();
    let admission = pipeline.service.purchase(100, 1).await.unwrap();

    for _ in 0..2 {
        pipeline.queue.receive().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
    }
    let received = pipeline.queue.next_delivery().await.unwrap();

    assert!(received.delivery.is_none());
    assert_eq!(received.dead_lettered.len(), 1);
    let letter = &received.dead_lettered[0];
    assert_eq!(letter.correlation_id, admission.order_id.to_string());
    assert_eq!(letter.original_routing_key, "seckill.order");
    assert_eq!(letter.routing_key, "dlx.order");
    assert_eq!(letter.delivery_count, 3);
    assert_eq!(pipeline.queue.dead_letters().await.unwrap().len(), 1);
    assert_eq!(pipeline.store.order_count(), 0);
}

// =============================================================================
// Daemon
// =============================================================================

#[tokio::test]
async fn test_daemon_workers_persist_admitted_orders() {
    let daemon = Daemon::new_memory(Config::test()).unwrap();
    let pipeline = daemon.pipeline();
    let mut events = pipeline.event_bus().subscribe();
    let begin = chrono::Utc::now();
    let voucher =
        seckill_domain::SeckillVoucher::new(3, 10, begin, begin + chrono::Duration::hours(1))
            .unwrap();
    pipeline.register_voucher(&voucher).await.unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(daemon.run_until(shutdown.clone()));

    let mut expected = HashSet::new();
    for user_id in 1..=5 {
        expected.insert(pipeline.purchase(user_id, 3).await.unwrap().order_id);
    }

    let persisted = tokio::time::timeout(Duration::from_secs(5), async {
        let mut persisted = HashSet::new();
        while persisted.len() < expected.len() {
            if let Some(Ok(PipelineEvent::OrderPersisted { order_id, outcome, .. })) =
                events.recv().await
            {
                assert_eq!(outcome, ProcessOutcome::Inserted);
                persisted.insert(order_id);
            }
        }
        persisted
    })
    .await
    .unwrap();

    assert_eq!(persisted, expected);
    assert_eq!(pipeline.metrics().orders_processed("inserted"), 5);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
