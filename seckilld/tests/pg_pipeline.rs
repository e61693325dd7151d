//! Integration test for the order pipeline on PostgreSQL backends.
//!
//! Run with: `cargo test -p seckilld --features postgres pg_pipeline`

#![cfg(feature = "postgres")]

use seckill_exec::{Disposition, PurchaseError};
use seckill_testkit::{count_orders, durable_stock};
use seckilld::{Config, Daemon};

/// Admission, queueing and the durable write all on PostgreSQL.
///
/// This test:
/// 1. Registers a voucher with stock 2 (durable row plus stock mirror)
/// 2. Admits two users and rejects a duplicate and a third user
/// 3. Drains the queue through the order processor
/// 4. Checks durable stock and order rows
#[sqlx::test(migrations = "../migrations")]
async fn test_pg_pipeline_end_to_end(pool: sqlx::PgPool) {
    let daemon = Daemon::new_postgres(Config::test(), pool.clone()).unwrap();
    let pipeline = daemon.pipeline();

    let begin = chrono::Utc::now();
    let voucher =
        seckill_domain::SeckillVoucher::new(77, 2, begin, begin + chrono::Duration::hours(1))
            .unwrap();
    pipeline.register_voucher(&voucher).await.unwrap();

    let first = pipeline.purchase(1, 77).await.unwrap();
    assert!(first.confirm.is_ack());
    assert!(matches!(pipeline.purchase(1, 77).await, Err(PurchaseError::DuplicatePurchase)));
    let second = pipeline.purchase(2, 77).await.unwrap();
    assert!(matches!(pipeline.purchase(3, 77).await, Err(PurchaseError::OutOfStock)));
    assert!(second.order_id > first.order_id);

    let mut acks = 0;
    while let Some(disposition) = pipeline.poll_once().await.unwrap() {
        assert_eq!(disposition, Disposition::Ack);
        acks += 1;
    }
    assert_eq!(acks, 2);

    assert_eq!(count_orders(&pool, 77).await.unwrap(), 2);
    assert_eq!(durable_stock(&pool, 77).await.unwrap(), 0);

    let order = pipeline.find_order(first.order_id).await.unwrap().unwrap();
    assert_eq!(order.user_id, 1);
    assert!(pipeline.dead_letters().await.unwrap().is_empty());
}

#[sqlx::test(migrations = "../migrations")]
async fn test_pg_malformed_intent_is_dead_lettered(pool: sqlx::PgPool) {
    use seckill_exec::{OrderQueue, PgOrderQueue};
    use std::sync::Arc;

    let daemon = Daemon::new_postgres(Config::test(), pool.clone()).unwrap();
    let pipeline = daemon.pipeline();

    let config = Config::test().queue_config();
    let queue = PgOrderQueue::new(Arc::new(pool.clone()), config);
    let routing_key = queue.topology().routing_key.clone();
    queue.publish(&routing_key, b"{oops".to_vec(), "bad-1".to_string()).await.unwrap();

    let disposition = pipeline.poll_once().await.unwrap();

    assert!(matches!(disposition, Some(Disposition::DeadLetter { .. })));
    let letters = pipeline.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].correlation_id, "bad-1");
    assert_eq!(letters[0].payload_text(), "{oops");
}
