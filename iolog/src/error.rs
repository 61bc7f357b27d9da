//! Error types
//!
//! Errors in this crate come from startup paths (configuration, store and broker
//! connections) and from [`AuditStore`](crate::store::AuditStore) implementations.
//! The audit path itself never returns them to a business exchange: the
//! recorder catches and logs every failure.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Audit store failure (unreachable backend, constraint violation, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Header map or payload could not be rendered as text
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// NATS error
    #[cfg(feature = "events")]
    #[error("NATS error: {0}")]
    Nats(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
