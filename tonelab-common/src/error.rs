//! Common error types for tonelab

use thiserror::Error;

/// Common result type for tonelab operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the tonelab crates.
///
/// Lookup misses are `NotFound`, operator mistakes are `InvalidInput`,
/// external tool failures are `Tool`, and anything the store cannot
/// recover from surfaces as `Database`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool failed: {0}")]
    Tool(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is a missing-entity lookup rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Database(sqlx::Error::RowNotFound)
        )
    }
}
