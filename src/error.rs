//! Error types for stable-request

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StableError>;

/// Errors surfaced by the request engine and its collaborators.
///
/// Most failures never leave the engine as `Err`: they are consolidated into
/// the returned outcome record. Only configuration errors and the two
/// explicit rethrow conditions propagate.
#[derive(Debug, Error, Clone)]
pub enum StableError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Request cancelled through the caller-provided token
    #[error("Request cancelled by caller")]
    Cancelled,

    /// Invalid request or engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connection, timeout, non-success status)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response arrived but was rejected by the response analyzer
    #[error("Response rejected by analyzer: {0}")]
    InvalidContent(String),

    /// A buffer transaction exceeded its configured budget
    #[error("Buffer transaction timed out after {0}ms")]
    BufferTimeout(u64),

    /// The buffer worker is gone (instance dropped mid-flight)
    #[error("Buffer is closed, transaction not accepted")]
    BufferClosed,

    /// A buffer transaction body failed
    #[error("Buffer transaction failed: {0}")]
    Transaction(String),

    /// User hook failure that the engine was asked to propagate
    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    /// Persistence load/store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// All attempts exhausted without an accepted response
    #[error("All {attempts} attempts exhausted: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
}

impl StableError {
    /// Check if this error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StableError::Transport(_)
                | StableError::InvalidContent(_)
                | StableError::BufferTimeout(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StableError::CircuitOpen
                | StableError::Cancelled
                | StableError::Config(_)
        )
    }

    /// Check if this error should contribute to circuit breaker failure counts
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            StableError::CircuitOpen | StableError::Config(_) | StableError::BufferClosed
        )
    }
}
