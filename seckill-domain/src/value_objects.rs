//! Value Objects for the seckill domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Order intent carries an unusable field
    #[error("Invalid order intent: {0}")]
    InvalidIntent(String),

    /// Admission script returned a code outside {0, 1, 2}
    #[error("Unknown admission code: {0}")]
    UnknownAdmissionCode(i64),

    /// Voucher definition rejected
    #[error("Invalid voucher: {0}")]
    InvalidVoucher(String),

    /// Order status code outside the known range
    #[error("Unknown order status: {0}")]
    UnknownOrderStatus(i16),
}

// =============================================================================
// Admission Outcome
// =============================================================================

/// Result of running the admission script for one purchase attempt.
///
/// The numeric codes are part of the fast-store contract:
/// `0` admitted, `1` sold out, `2` duplicate user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionOutcome {
    /// Stock reserved and user recorded in the purchase set
    Admitted,
    /// Stock counter was at or below zero; nothing mutated
    SoldOut,
    /// User already in the purchase set; nothing mutated
    DuplicateUser,
}

impl AdmissionOutcome {
    /// Decode the integer returned by the fast store.
    ///
    /// # Errors
    /// Returns `DomainError::UnknownAdmissionCode` for anything but 0, 1, 2.
    pub fn from_code(code: i64) -> Result<Self, DomainError> {
        match code {
            0 => Ok(Self::Admitted),
            1 => Ok(Self::SoldOut),
            2 => Ok(Self::DuplicateUser),
            other => Err(DomainError::UnknownAdmissionCode(other)),
        }
    }

    /// Integer code as produced by the admission script.
    pub fn code(&self) -> i64 {
        match self {
            Self::Admitted => 0,
            Self::SoldOut => 1,
            Self::DuplicateUser => 2,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::SoldOut => "sold_out",
            Self::DuplicateUser => "duplicate_user",
        }
    }

    /// Check if the purchase was granted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

impl fmt::Display for AdmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Order Status
// =============================================================================

/// Voucher order lifecycle status.
///
/// Stored as a small integer; the codes match the application's order table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Created by the flash sale pipeline, awaiting payment
    #[default]
    Unpaid,
    /// Paid
    Paid,
    /// Voucher redeemed
    Consumed,
    /// Cancelled before payment
    Cancelled,
    /// Refund requested
    Refunding,
    /// Refund completed
    Refunded,
}

impl OrderStatus {
    /// Database code for this status.
    pub fn code(&self) -> i16 {
        match self {
            Self::Unpaid => 1,
            Self::Paid => 2,
            Self::Consumed => 3,
            Self::Cancelled => 4,
            Self::Refunding => 5,
            Self::Refunded => 6,
        }
    }

    /// Decode a database status code.
    ///
    /// # Errors
    /// Returns `DomainError::UnknownOrderStatus` for codes outside 1..=6.
    pub fn from_code(code: i16) -> Result<Self, DomainError> {
        match code {
            1 => Ok(Self::Unpaid),
            2 => Ok(Self::Paid),
            3 => Ok(Self::Consumed),
            4 => Ok(Self::Cancelled),
            5 => Ok(Self::Refunding),
            6 => Ok(Self::Refunded),
            other => Err(DomainError::UnknownOrderStatus(other)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
