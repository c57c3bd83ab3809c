//! HTTP/1.1 transport over tokio sockets, rustls and hyper.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::uri::{PathAndQuery, Uri};
use http::{HeaderValue, Request};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::{BodySink, Connector, Destination, SocketOptions, Timeouts, Transport, TransportError};
use crate::{Response, TlsSettings};

/// Largest proxy `CONNECT` response head accepted.
const MAX_CONNECT_HEAD: usize = 8 * 1024;

trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Creates [`HyperTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperConnector;

impl Connector for HyperConnector {
    type Transport = HyperTransport;

    fn create(&self, destination: &Destination) -> HyperTransport {
        HyperTransport::new(destination.clone())
    }
}

/// One HTTP/1.1 connection driven by hyper.
///
/// The hyper connection future runs on its own task. Finishing the
/// transport aborts that task and drops the socket.
pub struct HyperTransport {
    destination: Destination,
    tls: Option<Arc<ClientConfig>>,
    handshake_timeout: Option<Duration>,
    socket_options: SocketOptions,
    timeouts: Timeouts,
    sender: Option<SendRequest<Full<Bytes>>>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("destination", &self.destination)
            .field("tls", &self.tls.is_some())
            .field("timeouts", &self.timeouts)
            .field("started", &self.sender.is_some())
            .finish()
    }
}

impl HyperTransport {
    /// Create an unstarted transport.
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            tls: None,
            handshake_timeout: None,
            socket_options: SocketOptions::default(),
            timeouts: Timeouts::default(),
            sender: None,
            driver: None,
        }
    }

    /// The destination this transport connects to.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let host = self.destination.connect_host();
        let port = self.destination.connect_port();
        trace!(host = %host, port, "Opening socket");

        let stream = with_deadline(self.timeouts.open, TcpStream::connect((host, port))).await??;
        self.apply_socket_options(&stream)?;
        Ok(stream)
    }

    fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        let options = &self.socket_options;
        stream.set_nodelay(options.nodelay)?;
        if let Some(ttl) = options.ttl {
            stream.set_ttl(ttl)?;
        }

        let socket = SockRef::from(stream);
        if let Some(idle) = options.keepalive {
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        if let Some(linger) = options.linger {
            socket.set_linger(Some(linger))?;
        }
        Ok(())
    }

    /// Ask the proxy to open a tunnel to the origin.
    async fn tunnel(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let authority = self.destination.authority();
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(credentials) = self
            .destination
            .proxy
            .as_ref()
            .and_then(|proxy| proxy.authorization())
        {
            head.push_str(&format!("Proxy-Authorization: {credentials}\r\n"));
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes()).await?;

        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() >= MAX_CONNECT_HEAD {
                return Err(TransportError::Proxy(
                    "CONNECT response head too large".to_string(),
                ));
            }
            if stream.read(&mut byte).await? == 0 {
                return Err(TransportError::Eof);
            }
            response.push(byte[0]);
        }

        let status_line = String::from_utf8_lossy(&response);
        let status = status_line
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok());

        match status {
            Some(code) if (200..300).contains(&code) => {
                debug!(authority = %authority, "Proxy tunnel established");
                Ok(())
            }
            Some(code) => Err(TransportError::Proxy(format!(
                "CONNECT {authority} rejected with status {code}"
            ))),
            None => Err(TransportError::BadResponse(
                "malformed CONNECT response".to_string(),
            )),
        }
    }

    async fn secure(&self, stream: TcpStream) -> Result<Box<dyn Io>, TransportError> {
        let config = match &self.tls {
            Some(config) => Arc::clone(config),
            None => TlsSettings::default().client_config()?,
        };

        let domain = ServerName::try_from(self.destination.host.clone())
            .map_err(|_| TransportError::TlsConfig("Invalid DNS name".to_string()))?;

        let deadline = self.handshake_timeout.or(self.timeouts.open);
        let tls_stream = with_deadline(deadline, TlsConnector::from(config).connect(domain, stream))
            .await?
            .map_err(|e| TransportError::Tls(format!("TLS handshake failed: {}", e)))?;

        Ok(Box::new(tls_stream))
    }

    fn request_target(&self, uri: &Uri) -> Result<Uri, TransportError> {
        let path = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        if self.forwards_absolute_form() {
            let scheme = if self.destination.tls { "https" } else { "http" };
            format!("{scheme}://{}{}", self.destination.authority(), path)
                .parse()
                .map_err(|e: http::uri::InvalidUri| TransportError::Other(e.to_string()))
        } else {
            Ok(Uri::from(path))
        }
    }

    /// Plain HTTP through a proxy sends absolute-form targets; everything
    /// else, tunnels included, uses origin-form.
    fn forwards_absolute_form(&self) -> bool {
        self.destination.proxy.is_some() && !self.destination.tls
    }

    async fn exchange(
        sender: &mut SendRequest<Full<Bytes>>,
        request: Request<Full<Bytes>>,
        sink: Option<&mut BodySink<'_>>,
    ) -> Result<Response, TransportError> {
        sender.ready().await.map_err(TransportError::from_hyper)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(TransportError::from_hyper)?;

        let (parts, mut body) = response.into_parts();
        let mut buffer = Vec::new();
        let mut sink = sink;

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(TransportError::from_hyper)?;
            if let Ok(chunk) = frame.into_data() {
                match sink.as_deref_mut() {
                    Some(sink) => sink(&chunk[..]),
                    None => buffer.extend_from_slice(&chunk),
                }
            }
        }

        Ok(Response::new(
            parts.status,
            parts.version,
            parts.headers,
            Bytes::from(buffer),
        ))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    fn configure_tls(&mut self, settings: &TlsSettings) -> Result<(), TransportError> {
        if self.destination.tls {
            self.tls = Some(settings.client_config()?);
        }
        self.handshake_timeout = settings.handshake_timeout();
        Ok(())
    }

    fn set_socket_options(&mut self, options: &SocketOptions) {
        self.socket_options = options.clone();
    }

    fn set_timeouts(&mut self, timeouts: &Timeouts) {
        self.timeouts = *timeouts;
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        self.finish();

        let mut stream = self.connect().await?;
        if self.destination.tls && self.destination.proxy.is_some() {
            with_deadline(self.timeouts.open, self.tunnel(&mut stream)).await??;
        }

        let io: Box<dyn Io> = if self.destination.tls {
            self.secure(stream).await?
        } else {
            Box::new(stream)
        };

        let (sender, connection) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(TransportError::from_hyper)?;

        let authority = self.destination.authority();
        self.driver = Some(tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(authority = %authority, error = %e, "Connection closed");
            }
        }));
        self.sender = Some(sender);

        debug!(
            host = %self.destination.host,
            port = self.destination.port,
            tls = self.destination.tls,
            proxied = self.destination.proxy.is_some(),
            "Connection started"
        );
        Ok(())
    }

    async fn send(
        &mut self,
        request: Request<Bytes>,
        sink: Option<&mut BodySink<'_>>,
    ) -> Result<Response, TransportError> {
        let (mut parts, body) = request.into_parts();
        parts.uri = self.request_target(&parts.uri)?;
        if !parts.headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.destination.authority())
                .map_err(|e| TransportError::Other(e.to_string()))?;
            parts.headers.insert(HOST, host);
        }
        if self.forwards_absolute_form()
            && let Some(credentials) = self
                .destination
                .proxy
                .as_ref()
                .and_then(|proxy| proxy.authorization())
        {
            let value = HeaderValue::from_str(&credentials)
                .map_err(|e| TransportError::Other(e.to_string()))?;
            parts.headers.insert(PROXY_AUTHORIZATION, value);
        }
        let request = Request::from_parts(parts, Full::new(body));

        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| TransportError::Closed("transport is not started".to_string()))?;

        with_deadline(self.timeouts.read, Self::exchange(sender, request, sink)).await?
    }

    fn finish(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if self.sender.take().is_some() {
            trace!(authority = %self.destination.authority(), "Connection finished");
        }
    }

    fn is_started(&self) -> bool {
        self.sender.is_some()
    }
}

impl Drop for HyperTransport {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Run `future` under an optional deadline.
async fn with_deadline<F: Future>(
    deadline: Option<Duration>,
    future: F,
) -> Result<F::Output, TransportError> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| TransportError::Timeout(limit)),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProxyTarget;

    fn destination(tls: bool, proxy: Option<ProxyTarget>) -> Destination {
        Destination {
            host: "example.com".to_string(),
            port: if tls { 443 } else { 80 },
            tls,
            proxy,
        }
    }

    #[test]
    fn test_origin_form() {
        let transport = HyperTransport::new(destination(false, None));
        let uri: Uri = "http://example.com/a?b=1".parse().unwrap();
        assert_eq!(transport.request_target(&uri).unwrap(), "/a?b=1");
    }

    #[test]
    fn test_absolute_form_through_proxy() {
        let proxy = ProxyTarget::new("proxy", 3128);
        let transport = HyperTransport::new(destination(false, Some(proxy)));
        let uri: Uri = "http://example.com/a".parse().unwrap();
        assert_eq!(
            transport.request_target(&uri).unwrap(),
            "http://example.com:80/a"
        );
    }

    #[test]
    fn test_tunnel_uses_origin_form() {
        let proxy = ProxyTarget::new("proxy", 3128);
        let transport = HyperTransport::new(destination(true, Some(proxy)));
        let uri: Uri = "https://example.com".parse().unwrap();
        assert_eq!(transport.request_target(&uri).unwrap(), "/");
    }

    #[tokio::test]
    async fn test_send_before_start() {
        let mut transport = HyperTransport::new(destination(false, None));
        let request = Request::new(Bytes::new());
        let err = transport.send(request, None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = HyperTransport::new(Destination {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            proxy: None,
        });
        let err = transport.start().await.unwrap_err();
        assert!(err.is_connection_refused());
        assert!(!transport.is_started());
    }
}
