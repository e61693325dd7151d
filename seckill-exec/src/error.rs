//! Execution layer error types.

use thiserror::Error;

/// Errors that can occur in the admission and processing paths.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Fast store unreachable or rejected the operation
    #[error("Fast store error: {0}")]
    FastStore(String),

    /// Order queue communication error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Distributed lock service error
    #[error("Lock error: {0}")]
    Lock(String),

    /// ID generator sequence exhausted for the current second
    #[error("ID sequence overflow for key {key}")]
    IdOverflow {
        /// Counter key that overflowed
        key: String,
    },

    /// Durable store error
    #[error("Store error: {0}")]
    Store(#[from] seckill_store::StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] seckill_domain::DomainError),

    /// Payload encoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Whether the failed operation may succeed if attempted again later.
    ///
    /// Domain errors describe the input itself and never heal on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FastStore(_) | Self::Queue(_) | Self::Lock(_) | Self::IdOverflow { .. } => true,
            Self::Store(e) => e.is_transient(),
            Self::Domain(_) | Self::Serialization(_) | Self::Config(_) => false,
        }
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// User-facing purchase failures.
///
/// Exactly one of these, or an order id, is returned from a purchase call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PurchaseError {
    /// No stock left at admission time
    #[error("out of stock")]
    OutOfStock,

    /// The user already holds an admission for this voucher
    #[error("duplicate purchase: each user may buy this voucher only once")]
    DuplicatePurchase,

    /// Generic transient failure; the whole purchase call is safe to retry
    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
}

impl PurchaseError {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::DuplicatePurchase => "duplicate_purchase",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

impl From<ExecError> for PurchaseError {
    fn from(err: ExecError) -> Self {
        Self::Unavailable(err.to_string())
    }
}
