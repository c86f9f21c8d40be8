//! Error types for COURIER operations.

use crate::EnumCodeError;
use thiserror::Error;

/// Durable-store errors.
///
/// Absence of a row is not represented here: keyed lookups return `Option`
/// and callers read `None` as "does not exist yet".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store corruption: {reason}")]
    Corruption { reason: String },

    #[error("Integrity violation on {table} for {key}: {reason}")]
    Integrity {
        table: &'static str,
        key: String,
        reason: String,
    },

    #[error("Bad argument {what}: {reason}")]
    Argument { what: &'static str, reason: String },

    #[error("Encoding error: {reason}")]
    Encoding { reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Schema version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: i32, expected: i32 },
}

/// Distribution-policy errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("No distribution rule matches topic {topic}")]
    NoMatch { topic: String },
}

/// Master error type for all COURIER errors.
#[derive(Debug, Clone, Error)]
pub enum CourierError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Code error: {0}")]
    Code(#[from] EnumCodeError),
}

/// Result type alias for COURIER operations.
pub type CourierResult<T> = Result<T, CourierError>;

// =============================================================================
// TESTS
// =============================================================================
