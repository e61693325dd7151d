//! Database lifecycle management for the seckill pipeline.
//!
//! Provides migration running, schema checks, and voucher seeding.

mod init;

pub use init::init_seckill_voucher;

use sqlx::PgPool;
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Tables the pipeline reads or writes.
pub const PIPELINE_TABLES: [&str; 8] = [
    "tb_seckill_voucher",
    "tb_voucher_order",
    "seckill_stock",
    "seckill_purchase",
    "seckill_id_counter",
    "seckill_lock",
    "seckill_queue_message",
    "seckill_dead_letter",
];

/// Unique constraint that makes a second order per (user, voucher) impossible.
pub const ONE_ORDER_PER_USER: &str = "uq_voucher_order_user_voucher";

/// Run all pending migrations.
///
/// Idempotent: safe to run multiple times.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");
    sqlx::migrate!("../migrations").run(pool).await?;
    info!("Migrations completed successfully");
    Ok(())
}

/// What `status` found in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    /// Latest applied migration, if the migration table exists
    pub latest_migration: Option<i64>,
    /// Pipeline tables that are missing
    pub missing_tables: Vec<String>,
    /// Whether the one-order-per-user constraint exists
    pub has_order_uniqueness: bool,
    /// Messages waiting or in flight on the order queue
    pub queue_depth: Option<i64>,
    /// Messages on the dead-letter path
    pub dead_letters: Option<i64>,
}

impl SchemaStatus {
    /// Every table and the uniqueness constraint are in place.
    pub fn is_complete(&self) -> bool {
        self.missing_tables.is_empty() && self.has_order_uniqueness
    }
}

/// Check the pipeline schema and report queue backlog.
pub async fn status(pool: &PgPool) -> Result<SchemaStatus> {
    let migrations_table: bool =
        sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let latest_migration: Option<i64> = if migrations_table {
        sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(pool)
            .await?
    } else {
        None
    };

    let mut missing_tables = Vec::new();
    for table in PIPELINE_TABLES {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(pool)
            .await?;
        if !exists {
            missing_tables.push(table.to_string());
        }
    }

    let has_order_uniqueness: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_constraint
            WHERE conname = $1 AND conrelid = to_regclass('tb_voucher_order')
        )
        "#,
    )
    .bind(ONE_ORDER_PER_USER)
    .fetch_one(pool)
    .await?;

    let queue_depth = count_if_present(pool, "seckill_queue_message", &missing_tables).await?;
    let dead_letters = count_if_present(pool, "seckill_dead_letter", &missing_tables).await?;

    let report = SchemaStatus {
        latest_migration,
        missing_tables,
        has_order_uniqueness,
        queue_depth,
        dead_letters,
    };

    match report.latest_migration {
        Some(version) => info!(version, "Latest migration"),
        None => warn!("No migrations applied (run `seckilld db migrate` first)"),
    }
    for table in &report.missing_tables {
        warn!(%table, "Pipeline table missing");
    }
    if !report.has_order_uniqueness {
        warn!(constraint = ONE_ORDER_PER_USER, "Order uniqueness constraint missing");
    }
    if let (Some(queued), Some(dead)) = (report.queue_depth, report.dead_letters) {
        info!(queued, dead, "Order queue");
    }

    Ok(report)
}

async fn count_if_present(pool: &PgPool, table: &str, missing: &[String]) -> Result<Option<i64>> {
    if missing.iter().any(|t| t == table) {
        return Ok(None);
    }
    // Table names come from PIPELINE_TABLES, never from input
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await?;
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_status_on_migrated_schema(pool: PgPool) {
        sqlx::query(
            r#"
            INSERT INTO seckill_queue_message (correlation_id, exchange, routing_key, payload)
            VALUES ('1', 'seckill.direct', 'seckill.order', '\x7b7d')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = status(&pool).await.unwrap();

        assert!(report.is_complete());
        assert!(report.latest_migration.is_some());
        assert_eq!(report.queue_depth, Some(1));
        assert_eq!(report.dead_letters, Some(0));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_status_flags_dropped_uniqueness(pool: PgPool) {
        sqlx::query("ALTER TABLE tb_voucher_order DROP CONSTRAINT uq_voucher_order_user_voucher")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DROP TABLE seckill_dead_letter").execute(&pool).await.unwrap();

        let report = status(&pool).await.unwrap();

        assert!(!report.is_complete());
        assert!(!report.has_order_uniqueness);
        assert_eq!(report.missing_tables, vec!["seckill_dead_letter".to_string()]);
        assert_eq!(report.dead_letters, None);
    }
}
