//! Test helper functions for database seeding.

use sqlx::PgPool;

use crate::Result;

/// Seed a voucher on sale for one hour, in both the durable table and the
/// stock mirror.
///
/// Uses INSERT ... ON CONFLICT so re-seeding resets the stock.
pub async fn seed_voucher(pool: &PgPool, voucher_id: i64, stock: i32) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time)
        VALUES ($1, $2, NOW(), NOW() + INTERVAL '1 hour')
        ON CONFLICT (voucher_id) DO UPDATE SET stock = EXCLUDED.stock, update_time = NOW()
        "#,
    )
    .bind(voucher_id)
    .bind(stock)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO seckill_stock (voucher_id, stock) VALUES ($1, $2)
        ON CONFLICT (voucher_id) DO UPDATE SET stock = EXCLUDED.stock
        "#,
    )
    .bind(voucher_id)
    .bind(i64::from(stock))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Durable stock of a voucher.
pub async fn durable_stock(pool: &PgPool, voucher_id: i64) -> Result<i32> {
    let stock = sqlx::query_scalar("SELECT stock FROM tb_seckill_voucher WHERE voucher_id = $1")
        .bind(voucher_id)
        .fetch_one(pool)
        .await?;
    Ok(stock)
}

/// Number of durable orders for a voucher.
pub async fn count_orders(pool: &PgPool, voucher_id: i64) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM tb_voucher_order WHERE voucher_id = $1")
        .bind(voucher_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
