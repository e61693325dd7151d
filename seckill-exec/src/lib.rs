//! Seckill Execution Layer
//!
//! The admission and processing halves of the flash-sale order pipeline.
//!
//! # Architecture
//!
//! ```text
//! purchase → IdWorker → FastStore::admit → OrderQueue → OrderProcessor → Store
//! ```
//!
//! # Components
//!
//! - **Ports**: Traits for the fast store, distributed lock and order queue
//! - **IdWorker**: Time-ordered 64-bit order ids
//! - **SeckillService**: Atomic admission and intent publishing
//! - **OrderProcessor**: Lock-guarded, idempotent durable write
//! - **Memory adapters**: Single-process implementations for tests and development
//! - **PostgreSQL adapters**: Feature `postgres`
//!
//! # Example
//!
//! ```rust,ignore
//! use seckill_exec::{MemoryFastStore, MemoryOrderQueue, SeckillService};
//! use std::sync::Arc;
//!
//! let service = SeckillService::new(
//!     Arc::new(MemoryFastStore::new()),
//!     Arc::new(MemoryOrderQueue::default()),
//! );
//! let admission = service.purchase(user_id, voucher_id).await?;
//! ```

#![warn(clippy::all)]

pub mod admission;
pub mod error;
pub mod id_worker;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod ports;
pub mod processor;
pub mod queue;

// Re-exports for convenience
pub use admission::{Admission, SeckillCatalog, SeckillService, ORDER_ID_KEY};
pub use error::{ExecError, ExecResult, PurchaseError};
pub use id_worker::IdWorker;
pub use memory::{MemoryFastStore, MemoryLockService};
#[cfg(feature = "postgres")]
pub use postgres::{PgFastStore, PgLockService, PgOrderQueue};
pub use ports::{
    order_lock_key, DeadLetter, Delivery, Disposition, FastStore, LockService, OrderQueue,
    PublishConfirm, QueueTopology, Received,
};
pub use processor::{disposition_for, OrderProcessor, ProcessError, ProcessOutcome, Processed};
pub use queue::{MemoryOrderQueue, QueueConfig};
