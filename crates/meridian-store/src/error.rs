//! Error types for item store operations.

use thiserror::Error;

/// Errors reported by a physical replica.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Item for table {table} is missing key attribute {key_attribute}")]
    MissingKey { table: String, key_attribute: String },

    #[error("Invalid update of attribute {attribute}: {reason}")]
    InvalidUpdate { attribute: String, reason: String },

    #[error("Replica unavailable: {0}")]
    Unavailable(String),

    #[error("Region not found: {0}")]
    RegionNotFound(String),
}

impl StoreError {
    /// Transport-level failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
