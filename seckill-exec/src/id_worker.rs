//! Globally unique, time-ordered order ids.
//!
//! Layout of a 64-bit id:
//!
//! ```text
//! [1 bit = 0][31 bits: seconds since 2022-01-01T00:00:00Z][32 bits: sequence]
//! ```
//!
//! The sequence comes from a fast-store counter keyed by
//! `icr:{businessKey}:{yyyy:MM:dd}`, so it never repeats within a day and the
//! timestamp orders ids across seconds. A clock stepping backwards is not
//! compensated.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{ExecError, ExecResult};
use crate::ports::FastStore;

/// Custom epoch: 2022-01-01T00:00:00Z.
pub const BEGIN_TIMESTAMP: i64 = 1_640_995_200;

/// Bits reserved for the sequence.
pub const COUNT_BITS: u32 = 32;

const MAX_TIMESTAMP: i64 = (1 << 31) - 1;

/// Order id generator backed by the fast store.
pub struct IdWorker {
    fast_store: Arc<dyn FastStore>,
}

impl IdWorker {
    /// Create an id generator.
    pub fn new(fast_store: Arc<dyn FastStore>) -> Self {
        Self { fast_store }
    }

    /// Next id for `business_key` at the current time.
    pub async fn next_id(&self, business_key: &str) -> ExecResult<u64> {
        self.next_id_at(business_key, Utc::now()).await
    }

    /// Next id for `business_key` as if the clock read `now`.
    pub async fn next_id_at(&self, business_key: &str, now: DateTime<Utc>) -> ExecResult<u64> {
        let timestamp = now.timestamp() - BEGIN_TIMESTAMP;
        if !(0..=MAX_TIMESTAMP).contains(&timestamp) {
            return Err(ExecError::Config(format!(
                "clock {} outside the id generator's range",
                now
            )));
        }

        let key = counter_key(business_key, now);
        let sequence = self.fast_store.increment(&key).await?;
        if sequence > u64::from(u32::MAX) {
            return Err(ExecError::IdOverflow { key });
        }

        // Timestamp is at most 31 bits wide, so the shift keeps the top bit clear.
        Ok(((timestamp as u64) << COUNT_BITS) | sequence)
    }
}

/// Fast-store key of the per-day sequence counter.
pub fn counter_key(business_key: &str, now: DateTime<Utc>) -> String {
    format!("icr:{}:{}", business_key, now.format("%Y:%m:%d"))
}

/// Seconds since the custom epoch encoded in an id.
pub fn timestamp_of(id: u64) -> u64 {
    id >> COUNT_BITS
}

// =============================================================================
// Tests
// =============================================================================
