//! Minimal data initialization.
//!
//! Seeds a seckill voucher and its fast-store stock mirror so a fresh
//! database can take purchases.

use sqlx::PgPool;
use tracing::info;

use super::Result;

/// Seed a voucher on sale for `sale_hours` starting now.
///
/// Uses INSERT ... ON CONFLICT DO NOTHING for idempotency; an existing
/// voucher keeps its current stock. Returns whether a new voucher was created.
pub async fn init_seckill_voucher(
    pool: &PgPool,
    voucher_id: i64,
    stock: i32,
    sale_hours: i32,
) -> Result<bool> {
    if voucher_id <= 0 {
        return Err(anyhow::anyhow!("voucher_id must be positive, got {}", voucher_id));
    }
    if stock < 0 || sale_hours <= 0 {
        return Err(anyhow::anyhow!(
            "invalid seed: stock={} sale_hours={}",
            stock,
            sale_hours
        ));
    }

    let mut tx = pool.begin().await?;

    let created = sqlx::query(
        r#"
        INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time, create_time, update_time)
        VALUES ($1, $2, NOW(), NOW() + make_interval(hours => $3), NOW(), NOW())
        ON CONFLICT (voucher_id) DO NOTHING
        "#,
    )
    .bind(voucher_id)
    .bind(stock)
    .bind(sale_hours)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if !created {
        info!(voucher_id, "Voucher already exists, leaving stock untouched");
        tx.commit().await?;
        return Ok(false);
    }

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

    info!(voucher_id, stock, sale_hours, "Seckill voucher seeded");
    Ok(true)
}
