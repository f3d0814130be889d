//! Error types for gpuhold

use thiserror::Error;

/// Main error type for gpuhold
#[derive(Error, Debug)]
pub enum GpuholdError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device enumeration query error
    #[error("Query error: {0}")]
    Query(String),

    /// Device selection or runtime error
    #[error("Device error: {0}")]
    Device(String),

    /// Device memory allocation error
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Compute step error
    #[error("Compute error: {0}")]
    Compute(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuhold operations
pub type GpuholdResult<T> = Result<T, GpuholdError>;

impl From<toml::de::Error> for GpuholdError {
    fn from(err: toml::de::Error) -> Self {
        GpuholdError::Config(err.to_string())
    }
}
