//! PostgreSQL durable store.
//!
//! Owns the authoritative voucher stock (`tb_seckill_voucher`) and the order
//! table (`tb_voucher_order`, unique on `(user_id, voucher_id)`).
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{CreateOrderOutcome, OrderRepository, Store, VoucherRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seckill_domain::{OrderId, OrderStatus, SeckillVoucher, UserId, VoucherId, VoucherOrder};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

/// Constraint enforcing one order per `(user_id, voucher_id)`.
const UNIQUE_USER_VOUCHER: &str = "uq_voucher_order_user_voucher";

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    /// Create a new PostgreSQL store.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Convert an unsigned identifier to the BIGINT column type.
pub(crate) fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Serialization(format!("id {} exceeds BIGINT", id)))
}

/// Convert a BIGINT column back to an unsigned identifier.
pub(crate) fn from_db_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Serialization(format!("negative id {}", id)))
}

fn parse_voucher_row(row: &sqlx::postgres::PgRow) -> Result<SeckillVoucher, StoreError> {
    let stock: i32 = row.try_get("stock")?;
    Ok(SeckillVoucher {
        voucher_id: from_db_id(row.try_get("voucher_id")?)?,
        stock: i64::from(stock),
        begin_time: row.try_get::<DateTime<Utc>, _>("begin_time")?,
        end_time: row.try_get::<DateTime<Utc>, _>("end_time")?,
        created_at: row.try_get::<DateTime<Utc>, _>("create_time")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("update_time")?,
    })
}

fn parse_order_row(row: &sqlx::postgres::PgRow) -> Result<VoucherOrder, StoreError> {
    let status: i16 = row.try_get("status")?;
    Ok(VoucherOrder {
        id: from_db_id(row.try_get("id")?)?,
        user_id: from_db_id(row.try_get("user_id")?)?,
        voucher_id: from_db_id(row.try_get("voucher_id")?)?,
        status: OrderStatus::from_code(status)?,
        created_at: row.try_get::<DateTime<Utc>, _>("create_time")?,
    })
}

// =============================================================================
// Voucher Repository Implementation
// =============================================================================

#[async_trait]
impl VoucherRepository for PgStore {
    async fn save(&self, voucher: &SeckillVoucher) -> Result<(), StoreError> {
        let stock = i32::try_from(voucher.stock)
            .map_err(|_| StoreError::Serialization(format!("stock {} exceeds INT", voucher.stock)))?;

        sqlx::query(
            r#"
            INSERT INTO tb_seckill_voucher (voucher_id, stock, begin_time, end_time, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (voucher_id) DO UPDATE SET
                stock = EXCLUDED.stock,
                begin_time = EXCLUDED.begin_time,
                end_time = EXCLUDED.end_time,
                update_time = EXCLUDED.update_time
            "#,
        )
        .bind(to_db_id(voucher.voucher_id)?)
        .bind(stock)
        .bind(voucher.begin_time)
        .bind(voucher.end_time)
        .bind(voucher.created_at)
        .bind(voucher.updated_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: VoucherId) -> Result<Option<SeckillVoucher>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT voucher_id, stock, begin_time, end_time, create_time, update_time
            FROM tb_seckill_voucher
            WHERE voucher_id = $1
            "#,
        )
        .bind(to_db_id(id)?)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(parse_voucher_row).transpose()
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn find_by_id(&self, id: OrderId) -> Result<Option<VoucherOrder>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, voucher_id, status, create_time
            FROM tb_voucher_order
            WHERE id = $1
            "#,
        )
        .bind(to_db_id(id)?)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(parse_order_row).transpose()
    }

    async fn count_by_user_and_voucher(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tb_voucher_order WHERE user_id = $1 AND voucher_id = $2",
        )
        .bind(to_db_id(user_id)?)
        .bind(to_db_id(voucher_id)?)
        .fetch_one(self.pool.as_ref())
        .await?;

        from_db_id(count)
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
    fn vouchers(&self) -> &dyn VoucherRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    async fn create_voucher_order(
        &self,
        order: &VoucherOrder,
    ) -> Result<CreateOrderOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE tb_seckill_voucher
            SET stock = stock - 1, update_time = NOW()
            WHERE voucher_id = $1 AND stock > 0
            "#,
        )
        .bind(to_db_id(order.voucher_id)?)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CreateOrderOutcome::StockExhausted);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO tb_voucher_order (id, user_id, voucher_id, status, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $5)
            "#,
        )
        .bind(to_db_id(order.id)?)
        .bind(to_db_id(order.user_id)?)
        .bind(to_db_id(order.voucher_id)?)
        .bind(order.status.code())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(CreateOrderOutcome::Created)
            },
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some(UNIQUE_USER_VOUCHER) =>
            {
                // Dropping the decrement together with the failed insert.
                tx.rollback().await?;
                debug!(
                    user_id = order.user_id,
                    voucher_id = order.voucher_id,
                    "Order already exists, decrement rolled back"
                );
                Ok(CreateOrderOutcome::AlreadyExists)
            },
            Err(e) => {
                tx.rollback().await?;
                Err(e.into())
            },
        }
    }
}
