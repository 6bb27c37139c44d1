//! Error types for the data model

use thiserror::Error;

/// Result type alias for model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised when a model invariant would be violated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid measurement group {key}: {reason}")]
    InvalidGroup { key: String, reason: String },
}
