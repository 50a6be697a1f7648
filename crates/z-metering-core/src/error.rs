//! Error types for z-metering.
//!
//! A duplicate record is not an error anywhere in this taxonomy: it is a normal
//! ingestion outcome reported through result values.

use rust_decimal::Decimal;

use crate::ids::IdError;
use crate::RecordKey;

/// Result type for z-metering operations.
pub type Result<T> = std::result::Result<T, MeterError>;

/// A malformed input detected before touching storage. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required identity field is blank.
    #[error("missing field {field} ({key})")]
    MissingField {
        /// Name of the blank field.
        field: &'static str,
        /// Key of the offending record, as far as it is known.
        key: RecordKey,
    },

    /// Quantity is negative and negative quantities are rejected.
    #[error("negative quantity {quantity} ({key})")]
    NegativeQuantity {
        /// Key of the offending record.
        key: RecordKey,
        /// The rejected quantity.
        quantity: Decimal,
    },

    /// The scope is incomplete.
    #[error("missing scope field {field}")]
    MissingScope {
        /// Name of the blank scope field.
        field: &'static str,
    },

    /// Granularity name not one of `hour`, `day`, `week`, `month`.
    #[error("unknown granularity: {0}")]
    UnknownGranularity(String),

    /// Batch exceeds the configured maximum size.
    #[error("batch of {size} records exceeds limit of {limit}")]
    BatchTooLarge {
        /// Submitted batch size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Errors that can occur in z-metering operations.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// Malformed record or parameter.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed query, rejected before storage is read.
    #[error("invalid query: {reason} ({params})")]
    Query {
        /// What is wrong with the query.
        reason: String,
        /// Rendering of the offending parameters.
        params: String,
    },

    /// Transient storage failure. The caller decides whether to retry.
    #[error("store unavailable after {committed} committed records: {message}")]
    StoreUnavailable {
        /// Underlying storage error.
        message: String,
        /// Records durably committed by this call before the failure.
        committed: usize,
        /// Key of the record being written when the failure occurred.
        key: Option<RecordKey>,
        /// Batch input indices not known to be stored. Resubmitting them is safe.
        pending: Vec<usize>,
    },

    /// The operation was cancelled or timed out.
    #[error(
        "operation cancelled after {committed} committed records ({} not attempted)",
        .pending.len()
    )]
    Cancelled {
        /// Records durably committed by this call before cancellation.
        committed: usize,
        /// Input indices that were not attempted and are safe to resubmit.
        pending: Vec<usize>,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl MeterError {
    /// Build a query error from a reason and the parameters that caused it.
    pub fn query(reason: impl Into<String>, params: impl std::fmt::Debug) -> Self {
        Self::Query {
            reason: reason.into(),
            params: format!("{params:?}"),
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Cancelled { .. })
    }
}
