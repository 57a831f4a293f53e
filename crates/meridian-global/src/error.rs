//! Error types for routing, metadata and replication.

use meridian_store::StoreError;
use thiserror::Error;

/// Errors surfaced by global table operations.
#[derive(Error, Debug, Clone)]
pub enum GlobalError {
    /// A physical replica failed; propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Global table not found: {0}")]
    TableNotFound(String),

    #[error("Item is missing primary key attribute {0}")]
    MissingPrimaryKey(String),

    #[error("Attribute {0} is reserved for replication metadata")]
    ReservedAttribute(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for GlobalError {
    fn from(err: serde_json::Error) -> Self {
        GlobalError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GlobalError>;
