//! Seckill Storage Layer
//!
//! Provides durable persistence for vouchers and orders.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use seckill_store::{CreateOrderOutcome, MemoryStore, Store};
//! use seckill_domain::{OrderIntent, SeckillVoucher, VoucherOrder};
//! use chrono::{Duration, Utc};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let begin = Utc::now();
//!     let voucher = SeckillVoucher::new(10, 100, begin, begin + Duration::hours(1)).unwrap();
//!     store.vouchers().save(&voucher).await.unwrap();
//!
//!     let order = VoucherOrder::from_intent(&OrderIntent::new(1, 42, 10));
//!     let outcome = store.create_voucher_order(&order).await.unwrap();
//!     assert_eq!(outcome, CreateOrderOutcome::Created);
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use repository::{CreateOrderOutcome, OrderRepository, Store, VoucherRepository};
