//! Transport error types and failure classification.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// How the request state machine reacts to a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The server sent a malformed response.
    BadResponse,
    /// The connection broke in a way a fresh connection may not.
    Transient,
    /// Anything else. Never retried.
    Fatal,
}

/// Errors raised by a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream before a complete response arrived.
    #[error("end of file reached")]
    Eof,

    /// TLS handshake or record failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// An open, read or handshake deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The response could not be parsed.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The connection was closed underneath the request.
    #[error("connection closed: {0}")]
    Closed(String),

    /// TLS parameters could not be turned into a client configuration.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// The proxy refused to open a tunnel.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Classify this failure for the retry state machine.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::BadResponse(_) => FailureClass::BadResponse,
            Self::Eof | Self::Tls(_) | Self::Timeout(_) | Self::Closed(_) => {
                FailureClass::Transient
            }
            Self::Io(e) if is_tls_io_error(e) => FailureClass::Transient,
            Self::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::TimedOut
                | io::ErrorKind::InvalidInput => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            Self::TlsConfig(_) | Self::Proxy(_) | Self::Other(_) => FailureClass::Fatal,
        }
    }

    /// Check if the peer actively refused the connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }

    /// Check if the destination host could not be reached.
    pub fn is_host_down(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable
            )
        )
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
            || matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// Map a hyper error onto the transport taxonomy.
    pub(crate) fn from_hyper(err: hyper::Error) -> Self {
        if err.is_parse() || err.is_parse_status() {
            return Self::BadResponse(err.to_string());
        }
        if err.is_incomplete_message() {
            return Self::Eof;
        }

        let io_kind = std::error::Error::source(&err)
            .and_then(|source| source.downcast_ref::<io::Error>())
            .map(|e| (e.kind(), is_tls_io_error(e), e.to_string()));

        match io_kind {
            Some((_, true, message)) => Self::Tls(message),
            Some((kind, false, message)) => Self::Io(io::Error::new(kind, message)),
            None if err.is_closed() || err.is_canceled() => Self::Closed(err.to_string()),
            None => Self::Other(err.to_string()),
        }
    }
}

/// tokio-rustls reports TLS record failures as I/O errors wrapping a
/// `rustls::Error`.
fn is_tls_io_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_io_kinds() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
            io::ErrorKind::InvalidInput,
        ] {
            let err = TransportError::from(io::Error::from(kind));
            assert_eq!(err.class(), FailureClass::Transient, "{kind:?}");
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(TransportError::Eof.class(), FailureClass::Transient);
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).class(),
            FailureClass::Transient
        );
        assert_eq!(
            TransportError::Tls("bad record mac".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            TransportError::BadResponse("wrong status line".into()).class(),
            FailureClass::BadResponse
        );
        assert_eq!(
            TransportError::TlsConfig("no cipher suites".into()).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            TransportError::Other("boom".into()).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied)).class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_wrapped_rustls_error_is_transient() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::DecryptError,
        );
        assert_eq!(TransportError::Io(err).class(), FailureClass::Transient);
    }

    #[test]
    fn test_connect_failures() {
        let refused = TransportError::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_connection_refused());
        assert!(!refused.is_host_down());

        let down = TransportError::from(io::Error::from(io::ErrorKind::HostUnreachable));
        assert!(down.is_host_down());
        assert!(!down.is_connection_refused());
    }
}
