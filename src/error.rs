//! Error types for the Turnstile service.

use thiserror::Error;

use crate::ratelimit::StoreError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid or missing policy values. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The rate state store could not serve a request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A request or stored key that does not map to a rate identity
    #[error("Malformed identity: {0}")]
    MalformedIdentity(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TurnstileError {
    fn from(err: ::config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
