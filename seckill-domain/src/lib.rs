//! Seckill Domain Layer
//!
//! Pure domain types with zero I/O dependencies.
//! Contains entities, value objects, and their validation rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
#[allow(missing_docs)]
pub mod entities;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{OrderId, OrderIntent, SeckillVoucher, UserId, VoucherId, VoucherOrder};
pub use value_objects::{AdmissionOutcome, DomainError, OrderStatus};
