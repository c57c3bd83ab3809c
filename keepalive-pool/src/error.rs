//! Pool error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No slot became available within the checkout timeout.
    #[error("timed out after {0:?} waiting for a connection pool slot")]
    Timeout(Duration),

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    Closed,
}
