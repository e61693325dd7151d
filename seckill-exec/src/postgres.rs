//! PostgreSQL adapters for the fast store, lock service and order queue.
//!
//! For deployments without a scripting key-value store: the admission script
//! becomes one transaction that locks the voucher's stock mirror row, leases
//! are rows with an expiry, and the queue is a table leased with
//! `FOR UPDATE SKIP LOCKED`.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use seckill_domain::{AdmissionOutcome, OrderId, UserId, VoucherId};

use crate::error::ExecError;
use crate::ports::{
    DeadLetter, Delivery, Disposition, FastStore, LockService, OrderQueue, PublishConfirm,
    QueueTopology, Received,
};
use crate::queue::QueueConfig;

fn fast_store_err(e: sqlx::Error) -> ExecError {
    ExecError::FastStore(e.to_string())
}

fn lock_err(e: sqlx::Error) -> ExecError {
    ExecError::Lock(e.to_string())
}

fn queue_err(e: sqlx::Error) -> ExecError {
    ExecError::Queue(e.to_string())
}

fn to_db_id(id: u64) -> Result<i64, ExecError> {
    i64::try_from(id).map_err(|_| ExecError::Serialization(format!("id {} exceeds BIGINT", id)))
}

// =============================================================================
// PostgreSQL Fast Store
// =============================================================================

/// Fast store backed by `seckill_stock`, `seckill_purchase` and `seckill_id_counter`.
pub struct PgFastStore {
    pool: Arc<PgPool>,
}

impl PgFastStore {
    /// Create a new PostgreSQL fast store.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FastStore for PgFastStore {
    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<AdmissionOutcome, ExecError> {
        let voucher = to_db_id(voucher_id)?;
        let user = to_db_id(user_id)?;
        let mut tx = self.pool.begin().await.map_err(fast_store_err)?;

        // Row lock serializes all admissions for this voucher.
        let stock: Option<i64> = sqlx::query_scalar(
            "SELECT stock FROM seckill_stock WHERE voucher_id = $1 FOR UPDATE",
        )
        .bind(voucher)
        .fetch_optional(&mut *tx)
        .await
        .map_err(fast_store_err)?;

        if stock.unwrap_or(0) <= 0 {
            tx.rollback().await.map_err(fast_store_err)?;
            return Ok(AdmissionOutcome::SoldOut);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO seckill_purchase (voucher_id, user_id, order_id, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (voucher_id, user_id) DO NOTHING
            "#,
        )
        .bind(voucher)
        .bind(user)
        .bind(to_db_id(order_id)?)
        .execute(&mut *tx)
        .await
        .map_err(fast_store_err)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(fast_store_err)?;
            return Ok(AdmissionOutcome::DuplicateUser);
        }

        sqlx::query("UPDATE seckill_stock SET stock = stock - 1 WHERE voucher_id = $1")
            .bind(voucher)
            .execute(&mut *tx)
            .await
            .map_err(fast_store_err)?;

        tx.commit().await.map_err(fast_store_err)?;
        debug!(voucher_id, user_id, order_id, "Admission reserved");
        Ok(AdmissionOutcome::Admitted)
    }

    async fn load_stock(&self, voucher_id: VoucherId, stock: i64) -> Result<(), ExecError> {
        sqlx::query(
            r#"
            INSERT INTO seckill_stock (voucher_id, stock) VALUES ($1, $2)
            ON CONFLICT (voucher_id) DO UPDATE SET stock = EXCLUDED.stock
            "#,
        )
        .bind(to_db_id(voucher_id)?)
        .bind(stock)
        .execute(self.pool.as_ref())
        .await
        .map_err(fast_store_err)?;
        Ok(())
    }

    async fn stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, ExecError> {
        sqlx::query_scalar("SELECT stock FROM seckill_stock WHERE voucher_id = $1")
            .bind(to_db_id(voucher_id)?)
            .fetch_optional(self.pool.as_ref())
            .await
            .map_err(fast_store_err)
    }

    async fn is_member(&self, voucher_id: VoucherId, user_id: UserId) -> Result<bool, ExecError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM seckill_purchase WHERE voucher_id = $1 AND user_id = $2)",
        )
        .bind(to_db_id(voucher_id)?)
        .bind(to_db_id(user_id)?)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(fast_store_err)
    }

    async fn increment(&self, key: &str) -> Result<u64, ExecError> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO seckill_id_counter (key, value) VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE SET value = seckill_id_counter.value + 1
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(fast_store_err)?;

        u64::try_from(value).map_err(|_| ExecError::FastStore(format!("counter {} is negative", key)))
    }
}

// =============================================================================
// PostgreSQL Lock Service
// =============================================================================

/// Lease lock backed by the `seckill_lock` table.
pub struct PgLockService {
    pool: Arc<PgPool>,
}

impl PgLockService {
    /// Create a new PostgreSQL lock service.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_lock(&self, key: &str, owner: Uuid, ttl: Duration) -> Result<bool, ExecError> {
        // Insert, or take over a lease whose holder let it expire.
        let taken = sqlx::query(
            r#"
            INSERT INTO seckill_lock (key, owner, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE seckill_lock.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(self.pool.as_ref())
        .await
        .map_err(lock_err)?;

        Ok(taken.rows_affected() == 1)
    }

    async fn unlock(&self, key: &str, owner: Uuid) -> Result<bool, ExecError> {
        let released = sqlx::query("DELETE FROM seckill_lock WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(self.pool.as_ref())
            .await
            .map_err(lock_err)?;

        Ok(released.rows_affected() == 1)
    }
}

// =============================================================================
// PostgreSQL Order Queue
// =============================================================================

/// Order queue backed by `seckill_queue_message` and `seckill_dead_letter`.
pub struct PgOrderQueue {
    pool: Arc<PgPool>,
    config: QueueConfig,
}

impl PgOrderQueue {
    /// Create a new PostgreSQL order queue.
    pub fn new(pool: Arc<PgPool>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    async fn move_to_dead_letter(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        message_id: i64,
        reason: &str,
    ) -> Result<DeadLetter, ExecError> {
        let row = sqlx::query(
            r#"
            DELETE FROM seckill_queue_message WHERE id = $1
            RETURNING correlation_id, exchange, routing_key, payload, delivery_count
            "#,
        )
        .bind(message_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(queue_err)?;

        let correlation_id: String = row.try_get("correlation_id").map_err(queue_err)?;
        let original_exchange: String = row.try_get("exchange").map_err(queue_err)?;
        let original_routing_key: String = row.try_get("routing_key").map_err(queue_err)?;
        let payload: Vec<u8> = row.try_get("payload").map_err(queue_err)?;
        let delivery_count: i32 = row.try_get("delivery_count").map_err(queue_err)?;

        let dead_lettered_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO seckill_dead_letter (
                correlation_id, original_exchange, original_routing_key,
                exchange, routing_key, payload, reason, delivery_count, dead_lettered_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING dead_lettered_at
            "#,
        )
        .bind(&correlation_id)
        .bind(&original_exchange)
        .bind(&original_routing_key)
        .bind(&self.config.topology.dead_letter_exchange)
        .bind(&self.config.topology.dead_letter_routing_key)
        .bind(&payload)
        .bind(reason)
        .bind(delivery_count)
        .fetch_one(&mut **tx)
        .await
        .map_err(queue_err)?;

        error!(%correlation_id, %reason, "Message dead-lettered");
        Ok(DeadLetter {
            correlation_id,
            original_exchange,
            original_routing_key,
            routing_key: self.config.topology.dead_letter_routing_key.clone(),
            payload,
            reason: reason.to_string(),
            delivery_count: u32::try_from(delivery_count).unwrap_or(0),
            dead_lettered_at,
        })
    }
}

#[async_trait]
impl OrderQueue for PgOrderQueue {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        correlation_id: String,
    ) -> Result<PublishConfirm, ExecError> {
        if routing_key != self.config.topology.routing_key {
            return Ok(PublishConfirm::Returned { reply_text: "NO_ROUTE".to_string() });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO seckill_queue_message (
                correlation_id, exchange, routing_key, payload, delivery_count, visible_at, created_at
            ) VALUES ($1, $2, $3, $4, 0, NOW(), NOW())
            "#,
        )
        .bind(&correlation_id)
        .bind(&self.config.topology.exchange)
        .bind(routing_key)
        .bind(payload)
        .execute(self.pool.as_ref())
        .await;

        // A failed insert is the broker refusing the message.
        Ok(match result {
            Ok(_) => PublishConfirm::Ack,
            Err(e) => PublishConfirm::Nack { cause: e.to_string() },
        })
    }

    async fn next_delivery(&self) -> Result<Received, ExecError> {
        let mut received = Received::default();
        loop {
            let mut tx = self.pool.begin().await.map_err(queue_err)?;

            let row = sqlx::query(
                r#"
                WITH next AS (
                    SELECT id
                    FROM seckill_queue_message
                    WHERE visible_at <= NOW()
                    ORDER BY id
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                UPDATE seckill_queue_message m
                SET delivery_count = m.delivery_count + 1,
                    attempts = m.attempts + 1,
                    delivery_tag = nextval('seckill_delivery_tag_seq'),
                    visible_at = NOW() + make_interval(secs => $1)
                FROM next
                WHERE m.id = next.id
                RETURNING m.id, m.delivery_tag, m.delivery_count, m.attempts, m.correlation_id,
                          m.exchange, m.routing_key, m.payload
                "#,
            )
            .bind(self.config.ack_timeout.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(queue_err)?;

            let Some(row) = row else {
                tx.rollback().await.map_err(queue_err)?;
                return Ok(received);
            };

            let id: i64 = row.try_get("id").map_err(queue_err)?;
            let delivery_count: i32 = row.try_get("delivery_count").map_err(queue_err)?;
            let delivery_count = u32::try_from(delivery_count).unwrap_or(0);
            let attempts: i32 = row.try_get("attempts").map_err(queue_err)?;
            let attempts = u32::try_from(attempts).unwrap_or(0);

            if attempts > self.config.max_deliveries {
                let reason = format!(
                    "delivery limit exceeded ({} > {})",
                    attempts, self.config.max_deliveries
                );
                let letter = self.move_to_dead_letter(&mut tx, id, &reason).await?;
                tx.commit().await.map_err(queue_err)?;
                received.dead_lettered.push(letter);
                continue;
            }

            let delivery_tag: i64 = row.try_get("delivery_tag").map_err(queue_err)?;
            let delivery = Delivery {
                delivery_tag: u64::try_from(delivery_tag).unwrap_or(0),
                delivery_count,
                redelivered: delivery_count > 1,
                correlation_id: row.try_get("correlation_id").map_err(queue_err)?,
                exchange: row.try_get("exchange").map_err(queue_err)?,
                routing_key: row.try_get("routing_key").map_err(queue_err)?,
                payload: row.try_get("payload").map_err(queue_err)?,
            };
            tx.commit().await.map_err(queue_err)?;

            if delivery.redelivered {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    delivery_count,
                    correlation_id = %delivery.correlation_id,
                    "Redelivering message"
                );
            }
            received.delivery = Some(delivery);
            return Ok(received);
        }
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> Result<(), ExecError> {
        let tag = to_db_id(delivery_tag)?;
        let mut tx = self.pool.begin().await.map_err(queue_err)?;

        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM seckill_queue_message WHERE delivery_tag = $1 FOR UPDATE",
        )
        .bind(tag)
        .fetch_optional(&mut *tx)
        .await
        .map_err(queue_err)?;

        let Some(id) = id else {
            tx.rollback().await.map_err(queue_err)?;
            return Err(ExecError::Queue(format!(
                "Unknown or expired delivery tag {}",
                delivery_tag
            )));
        };

        match &disposition {
            Disposition::Ack => {
                sqlx::query("DELETE FROM seckill_queue_message WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(queue_err)?;
            },
            Disposition::Redeliver => {
                sqlx::query(
                    r#"
                    UPDATE seckill_queue_message
                    SET delivery_tag = NULL, visible_at = NOW() + make_interval(secs => $2)
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(self.config.retry_delay.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(queue_err)?;
            },
            Disposition::Defer => {
                sqlx::query(
                    r#"
                    UPDATE seckill_queue_message
                    SET delivery_tag = NULL,
                        attempts = GREATEST(attempts - 1, 0),
                        visible_at = NOW() + make_interval(secs => $2)
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(self.config.retry_delay.as_secs_f64())
                .execute(&mut *tx)
                .await
                .map_err(queue_err)?;
            },
            Disposition::DeadLetter { reason } => {
                self.move_to_dead_letter(&mut tx, id, reason).await?;
            },
        }

        tx.commit().await.map_err(queue_err)?;
        debug!(delivery_tag, disposition = disposition.as_str(), "Delivery settled");
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, ExecError> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, original_exchange, original_routing_key, routing_key,
                   payload, reason, delivery_count, dead_lettered_at
            FROM seckill_dead_letter
            ORDER BY id
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(queue_err)?;

        rows.iter()
            .map(|row| {
                let delivery_count: i32 = row.try_get("delivery_count").map_err(queue_err)?;
                Ok(DeadLetter {
                    correlation_id: row.try_get("correlation_id").map_err(queue_err)?,
                    original_exchange: row.try_get("original_exchange").map_err(queue_err)?,
                    original_routing_key: row
                        .try_get("original_routing_key")
                        .map_err(queue_err)?,
                    routing_key: row.try_get("routing_key").map_err(queue_err)?,
                    payload: row.try_get("payload").map_err(queue_err)?,
                    reason: row.try_get("reason").map_err(queue_err)?,
                    delivery_count: u32::try_from(delivery_count).unwrap_or(0),
                    dead_lettered_at: row
                        .try_get::<DateTime<Utc>, _>("dead_lettered_at")
                        .map_err(queue_err)?,
                })
            })
            .collect()
    }

    fn topology(&self) -> &QueueTopology {
        &self.config.topology
    }
}
