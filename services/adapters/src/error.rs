//! Error types for the adapters module

use state_sync::{CacheError, DecodeError, FetchError, HttpError, RegistryError};
use thiserror::Error;

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Configured address is not `0x` + 40 hex characters
    #[error("Invalid address for {field}: {value}")]
    InvalidAddress {
        /// The setting that held the address
        field: String,
        /// The rejected value
        value: String,
    },

    /// Vault pool id is not 32 bytes of hex
    #[error("Invalid pool id: {0}")]
    InvalidPoolId(String),

    /// Pool family this integration cannot track
    #[error("Unsupported pool type: {0}")]
    UnsupportedPoolType(String),

    /// Quote request rejected before any network traffic
    #[error("Invalid quote request: {0}")]
    InvalidQuote(String),

    /// Response decoded but failed semantic validation
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error in adapter settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// JSON parsing error from an API response
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl AdapterError {
    /// Transient remote failures; the next scheduled attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Http(_) | AdapterError::Fetch(_) | AdapterError::Cache(_)
        )
    }
}
