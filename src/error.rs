//! Error types for the Turnstile rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile storage operations.
///
/// None of these variants ever reach callers of the failover
/// coordinator's public surface; they exist so backends can report
/// *why* a call failed and the coordinator can decide where to route
/// the next attempt.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The backend was never given a usable configuration.
    #[error("{0} storage is not configured")]
    Unconfigured(&'static str),

    /// The storage medium was unreachable at call time.
    #[error("storage unreachable: {0}")]
    Connectivity(String),

    /// Persisted state exists but could not be read back.
    #[error("corrupt persisted state: {0}")]
    CorruptState(String),

    /// A storage operation exceeded its deadline.
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// Redis protocol or connection errors
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile storage operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
