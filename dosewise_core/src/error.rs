//! Error types for the dosewise_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for dosewise_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A dose was rejected before any state change (bad amount, unknown substance)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Registry lookup for a substance that was never registered
    #[error("Unknown substance: {0}")]
    UnknownSubstance(String),

    /// Durable store I/O failure
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// A dose record could not be encoded for the store
    #[error("Storage format error: {0}")]
    StorageFormat(#[from] serde_json::Error),

    /// Invalid registry, rule table or engine settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    /// True for errors raised by the durable store rather than by validation
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::StorageFormat(_))
    }
}
