//! Error types for the lockout engine
//!
//! Errors fall into four groups that the engine treats differently:
//!
//! - **Hot-path store errors** ([`Error::Redis`], [`Error::Store`],
//!   [`Error::Timeout`], [`Error::CircuitOpen`]) are transient. The policy
//!   engine absorbs them according to the configured fail mode.
//! - **Configuration errors** ([`Error::Config`], [`Error::InvalidConfig`]) are
//!   fatal at startup.
//! - **Audit storage errors** ([`Error::Storage`], [`Error::Database`]) are
//!   logged by the audit pipeline and never reach the login path.
//! - **Administrative errors** surface whatever the store returned.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the lockout engine
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration was loaded but failed validation
    #[error("Invalid lockout configuration: {0}")]
    InvalidConfig(String),

    /// Redis error
    #[cfg(feature = "cache")]
    #[error("Redis error: {0}")]
    Redis(Box<redis::RedisError>),

    /// PostgreSQL error
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(Box<sqlx::Error>),

    /// Hot-path store failure that is not a Redis protocol error
    /// (pool exhaustion, malformed record, etc.)
    #[error("Lockout store error: {0}")]
    Store(String),

    /// A hot-path store call exceeded its time budget
    #[error("Lockout store {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Store operation that timed out
        operation: &'static str,
        /// Configured budget in milliseconds
        timeout_ms: u64,
    },

    /// The circuit breaker refused the call without touching the store
    #[error("Lockout store circuit breaker is open")]
    CircuitOpen,

    /// Audit storage failure
    #[error("Audit storage error: {0}")]
    Storage(String),

    /// Attempt type that does not match the accepted pattern
    #[error("Invalid attempt type: {0:?}")]
    InvalidAttemptType(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error came from the hot-path store or its circuit breaker
    ///
    /// These are the errors the fail-open/fail-closed policy governs.
    pub fn is_store_unavailable(&self) -> bool {
        match self {
            #[cfg(feature = "cache")]
            Error::Redis(_) => true,
            Error::Store(_) | Error::Timeout { .. } | Error::CircuitOpen => true,
            _ => false,
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(Box::new(err))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(Box::new(err))
    }
}
