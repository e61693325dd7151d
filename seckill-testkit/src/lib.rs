//! Test helpers for the seckill pipeline.
//!
//! Provides in-memory pipeline wiring and seeding helpers for
//! database-backed tests.

mod helpers;
mod pipeline;

pub use helpers::{count_orders, durable_stock, seed_voucher};
pub use pipeline::MemoryPipeline;

use anyhow::Result;
use sqlx::PgPool;

/// Setup a clean test database by running migrations.
///
/// Convenience function for tests that need a fresh schema.
/// Note: migrations are located at `migrations/` relative to workspace root.
pub async fn setup_test_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}
