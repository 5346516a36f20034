//! Common error types for Offramp
//!
//! This module defines all error types used across the Offramp system.
//! All errors are convertible to HTTP status codes for proper error propagation
//! at the gateway boundary.

use thiserror::Error;

/// Main error type for Offramp
#[derive(Error, Debug)]
pub enum OfframpError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by a wrapped callable during execution
    #[error("Callable error: {0}")]
    Callable(String),

    /// Fatal fault in a worker's own dispatch logic
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// All worker queues at capacity (backpressure)
    #[error("System overloaded: {0}")]
    Overloaded(String),

    /// Consumer cancelled or disconnected before resolution
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Request still pending when the shutdown deadline elapsed
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// No live worker to route to
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Timeout waiting for a result
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OfframpError {
    /// Convert error to an HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            OfframpError::Config(_) => 500,
            OfframpError::Callable(_) => 500,
            OfframpError::WorkerFault(_) => 500,
            OfframpError::Overloaded(_) => 429,
            OfframpError::Cancelled(_) => 499,
            OfframpError::Shutdown(_) => 503,
            OfframpError::WorkerUnavailable(_) => 503,
            OfframpError::Timeout(_) => 504,
            OfframpError::InvalidInput(_) => 400,
            OfframpError::Serialization(_) => 400,
            OfframpError::Io(_) => 500,
            OfframpError::Internal(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        OfframpError::Config(msg.into())
    }

    /// Create a callable error
    pub fn callable(msg: impl Into<String>) -> Self {
        OfframpError::Callable(msg.into())
    }

    /// Create a worker fault error
    pub fn worker_fault(msg: impl Into<String>) -> Self {
        OfframpError::WorkerFault(msg.into())
    }

    /// Create an overloaded error
    pub fn overloaded(msg: impl Into<String>) -> Self {
        OfframpError::Overloaded(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        OfframpError::Cancelled(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        OfframpError::Shutdown(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        OfframpError::WorkerUnavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        OfframpError::Timeout(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        OfframpError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        OfframpError::Internal(msg.into())
    }

    /// Whether this error is recoverable at the request boundary
    ///
    /// Every variant is; only a worker fault also removes capacity.
    pub fn removes_capacity(&self) -> bool {
        matches!(self, OfframpError::WorkerFault(_))
    }
}

/// Result type alias for Offramp operations
pub type Result<T> = std::result::Result<T, OfframpError>;
