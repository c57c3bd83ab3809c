//! Client error types.

use keepalive_pool::PoolError;
use std::time::Duration;
use thiserror::Error;

use crate::{ConnectionDiagnostics, TransportError};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No pooled connection became available in time.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The client has been shut down.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// The destination refused the connection.
    #[error("Connection refused: {address}:{port}")]
    ConnectionRefused {
        /// Destination address.
        address: String,
        /// Destination port.
        port: u16,
    },

    /// The destination host could not be reached.
    #[error("Host down: {address}:{port}")]
    HostDown {
        /// Destination address.
        address: String,
        /// Destination port.
        port: u16,
    },

    /// The server sent malformed responses and retrying did not help.
    #[error("Too many bad responses {diagnostics}")]
    TooManyBadResponses {
        /// Connection state at the failure.
        diagnostics: ConnectionDiagnostics,
    },

    /// The connection kept breaking and retrying did not help.
    #[error("Too many connection resets (due to {source}) {diagnostics}")]
    TooManyConnectionResets {
        /// The failure that ended the request.
        source: TransportError,
        /// Connection state at the failure.
        diagnostics: ConnectionDiagnostics,
    },

    /// Any other transport failure, never retried.
    #[error(transparent)]
    Transport(TransportError),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request building error.
    #[error("Failed to build request: {0}")]
    RequestBuild(String),

    /// Response body could not be decoded.
    #[error("Failed to decode response body: {0}")]
    Decode(String),
}

impl Error {
    /// Check if this is a pool timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout(_))
    }

    /// Check if this is a connect failure.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::ConnectionRefused { .. } | Self::HostDown { .. })
    }

    /// Get the transport failure behind this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            Self::TooManyConnectionResets { source, .. } | Self::Transport(source) => Some(source),
            _ => None,
        }
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout(waited) => Self::PoolTimeout(waited),
            PoolError::Closed => Self::PoolClosed,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Self::RequestBuild(err.to_string())
    }
}
