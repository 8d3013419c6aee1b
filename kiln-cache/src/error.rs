//! Error types for the store

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur when talking to a store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// The distributed backend rejected or failed a command
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A set scan asked for more members than the set holds
    #[error("Too much members: requested {requested}, set holds {available}")]
    TooManyMembers {
        /// Number of targets requested
        requested: usize,
        /// Cardinality of the set
        available: usize,
    },

    /// Unsupported store URL
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
}
