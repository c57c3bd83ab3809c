//! Transport capability consumed by the client.
//!
//! The client never touches sockets or TLS sessions itself. It asks a
//! [`Connector`] for one [`Transport`] per pooled connection and drives
//! it through `configure_tls`, `start`, `send` and `finish`.

mod error;
mod http1;

pub use http1::{HyperConnector, HyperTransport};
pub use error::{FailureClass, TransportError};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::{ProxyTarget, Response, TlsSettings};

/// Receives response body chunks as they arrive.
pub type BodySink<'a> = dyn FnMut(&[u8]) + Send + 'a;

/// Where a transport connects and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Origin host.
    pub host: String,
    /// Origin port.
    pub port: u16,
    /// Whether the origin speaks TLS.
    pub tls: bool,
    /// Proxy the connection is routed through, if any.
    pub proxy: Option<ProxyTarget>,
}

impl Destination {
    /// Host the socket connects to: the proxy when routed, else the origin.
    pub fn connect_host(&self) -> &str {
        self.proxy.as_ref().map_or(&self.host, |proxy| &proxy.host)
    }

    /// Port the socket connects to.
    pub fn connect_port(&self) -> u16 {
        self.proxy.as_ref().map_or(self.port, |proxy| proxy.port)
    }

    /// `host:port` of the origin.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Socket options applied once when a transport starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// IP time-to-live.
    pub ttl: Option<u32>,
    /// TCP keepalive probe idle time.
    pub keepalive: Option<Duration>,
    /// SO_LINGER duration.
    pub linger: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            ttl: None,
            keepalive: None,
            linger: None,
        }
    }
}

/// Timeouts reapplied to a transport on every checkout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Connect (and handshake) deadline.
    pub open: Option<Duration>,
    /// Deadline for each response read.
    pub read: Option<Duration>,
}

/// Creates transports for destinations.
pub trait Connector: Send + Sync + 'static {
    /// The transport type produced.
    type Transport: Transport;

    /// Create an unstarted transport for `destination`.
    fn create(&self, destination: &Destination) -> Self::Transport;
}

/// One network connection to a destination.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Apply TLS parameters. Takes effect on the next `start`.
    fn configure_tls(&mut self, settings: &TlsSettings) -> Result<(), TransportError>;

    /// Record socket options to apply on the next `start`.
    fn set_socket_options(&mut self, options: &SocketOptions);

    /// Apply open, read and keep-alive timeouts.
    fn set_timeouts(&mut self, timeouts: &Timeouts);

    /// Open the connection, including any TLS handshake.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Send one request and read its response.
    ///
    /// With a sink, body chunks are handed to it as they arrive and the
    /// returned response carries an empty body.
    async fn send(
        &mut self,
        request: http::Request<Bytes>,
        sink: Option<&mut BodySink<'_>>,
    ) -> Result<Response, TransportError>;

    /// Send a batch of requests in order on this connection.
    async fn pipeline(
        &mut self,
        requests: Vec<http::Request<Bytes>>,
    ) -> Result<Vec<Response>, TransportError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.send(request, None).await?);
        }
        Ok(responses)
    }

    /// Close the connection. Safe to call when not started.
    fn finish(&mut self);

    /// Whether the connection is open.
    fn is_started(&self) -> bool;
}
