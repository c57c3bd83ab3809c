//! Persistent HTTP client.

use bytes::Bytes;
use http::header::{CONNECTION, HOST, HeaderName, HeaderValue};
use http::{Method, Request, Uri, Version};
use keepalive_pool::{Checkout, ConnectionPool, PoolStatus};
use parking_lot::RwLock;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use crate::response::has_token;
use crate::retry::{Attempt, RetryState, can_retry};
use crate::{
    BodySink, CallerId, ClientConfig, Connection, Connector, Destination, Error, FailureClass,
    HyperConnector, PoolKey, ProxyTarget, Response, Result, SocketOptions, Timeouts, TlsSettings,
    TlsVersion, Transport, TransportError, VerifyCallback, VerifyMode,
};

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

type Lease<'a, T> = Checkout<'a, PoolKey, Connection<T>>;

/// Scheme, host and port of a request URL.
#[derive(Debug, Clone)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self> {
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
            None => return Err(Error::InvalidUrl(format!("{uri}: URL must be absolute"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUrl(format!("{uri}: URL has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self { tls, host, port })
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `Host` header value, omitting the scheme's default port.
    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// An HTTP client that keeps connections open between requests.
///
/// Connections are pooled per caller and destination. Before each use a
/// connection is checked against the current TLS generation and the idle
/// and request-count limits, and reopened when stale. Requests that fail
/// with a malformed response or a broken connection are retried once
/// each when the method is idempotent or non-idempotent retries are
/// enabled.
///
/// ```rust,no_run
/// use keepalive_client::{CallerId, PersistentHttpClient};
///
/// # async fn example() -> keepalive_client::Result<()> {
/// let client = PersistentHttpClient::default();
/// let caller = CallerId::new();
///
/// let first = client.get(caller, "https://example.com/").await?;
/// let second = client.get(caller, "https://example.com/about").await?; // same socket
/// # Ok(())
/// # }
/// ```
pub struct PersistentHttpClient<C: Connector = HyperConnector> {
    connector: C,
    pool: ConnectionPool<PoolKey, Connection<C::Transport>>,
    settings: RwLock<ClientConfig>,
    tls_generation: AtomicU64,
    routing_generation: AtomicU64,
    http_versions: RwLock<HashMap<String, Version>>,
}

impl PersistentHttpClient<HyperConnector> {
    /// Create a client using the hyper transport.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, HyperConnector)
    }
}

impl Default for PersistentHttpClient<HyperConnector> {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl<C: Connector> PersistentHttpClient<C> {
    /// Create a client that opens transports through `connector`.
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        Self {
            connector,
            pool: ConnectionPool::new(config.pool.clone()),
            settings: RwLock::new(config),
            tls_generation: AtomicU64::new(0),
            routing_generation: AtomicU64::new(0),
            http_versions: RwLock::new(HashMap::new()),
        }
    }

    /// Client name.
    pub fn name(&self) -> String {
        self.settings.read().name.clone()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ClientConfig {
        self.settings.read().clone()
    }

    /// Current TLS generation.
    pub fn tls_generation(&self) -> u64 {
        self.tls_generation.load(Ordering::Acquire)
    }

    /// Current routing generation.
    pub fn routing_generation(&self) -> u64 {
        self.routing_generation.load(Ordering::Acquire)
    }

    /// Protocol version last seen from `url`'s host and port.
    pub fn http_version(&self, url: &str) -> Result<Option<Version>> {
        let target = Target::from_uri(&parse_uri(url)?)?;
        Ok(self.http_versions.read().get(&target.authority()).copied())
    }

    /// Pool statistics.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Send a GET request.
    pub async fn get(&self, caller: CallerId, url: &str) -> Result<Response> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(parse_uri(url)?)
            .body(Bytes::new())?;
        self.request(caller, request).await
    }

    /// Send `request` on `caller`'s connection to the request's host.
    ///
    /// The request URI must be absolute.
    pub async fn request(&self, caller: CallerId, request: Request<Bytes>) -> Result<Response> {
        self.execute(caller, request, None).await
    }

    /// Like [`request`](Self::request), but hands body chunks to `sink` as
    /// they arrive. The returned response has an empty body.
    pub async fn request_streaming(
        &self,
        caller: CallerId,
        request: Request<Bytes>,
        sink: &mut BodySink<'_>,
    ) -> Result<Response> {
        self.execute(caller, request, Some(sink)).await
    }

    /// Send a batch of requests to one destination over a single
    /// connection, holding it for the whole batch.
    ///
    /// The destination is taken from the first request. Batches are not
    /// retried.
    pub async fn pipeline(
        &self,
        caller: CallerId,
        requests: Vec<Request<Bytes>>,
    ) -> Result<Vec<Response>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let target = Target::from_uri(first.uri())?;

        let mut conn = self.checkout(caller, &target).await?;
        let requests = requests
            .into_iter()
            .map(|mut request| {
                self.apply_headers(&mut request, &target)?;
                Ok(request)
            })
            .collect::<Result<Vec<_>>>()?;
        let count = requests.len() as u64;

        debug!(authority = %target.authority(), requests = count, "Pipelining requests");
        let result = conn.transport.pipeline(requests).await;
        conn.request_count += count;

        match result {
            Ok(responses) => {
                if responses.last().is_some_and(Response::ends_connection) {
                    conn.finish();
                }
                if let Some(response) = responses.first() {
                    self.record_version(&target, response.version());
                }
                conn.last_used = Some(Instant::now());
                Ok(responses)
            }
            Err(err) => {
                conn.finish();
                conn.last_used = Some(Instant::now());
                Err(Error::Transport(err))
            }
        }
    }

    /// Probe how long `url`'s server keeps an idle connection open.
    ///
    /// Sends HEAD requests on one connection, waiting 1, 2, 3... seconds
    /// between them, and returns the longest wait after which a request
    /// still succeeded. Stops at `max` seconds. Any connection failure,
    /// including a refused connect or a non-2xx answer, ends the probe.
    ///
    /// Malformed URLs and pool errors are returned as errors.
    pub async fn detect_idle_timeout(&self, url: &str, max: u64) -> Result<Duration> {
        let uri = parse_uri(url)?;
        let target = Target::from_uri(&uri)?;
        let mut request = Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .body(Bytes::new())?;
        self.apply_headers(&mut request, &target)?;

        let mut conn = self.lease(CallerId::new(), &target).await?;
        if let Err(e) = self.validate(&mut conn).await {
            debug!(authority = %target.authority(), error = %e, "Idle probe could not connect");
            conn.discard();
            return Ok(Duration::ZERO);
        }

        let mut last_ok = 0;
        let mut wait = 0;
        loop {
            match conn.transport.send(clone_request(&request), None).await {
                Ok(response) if response.is_success() => {
                    last_ok = wait;
                    debug!(wait, status = %response.status(), "Idle probe succeeded");
                }
                Ok(response) => {
                    debug!(wait, status = %response.status(), "Idle probe got bad status");
                    break;
                }
                Err(e) => {
                    debug!(wait, error = %e, "Idle probe failed");
                    break;
                }
            }

            if wait >= max {
                break;
            }
            wait += 1;
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        conn.finish();
        conn.discard();
        Ok(Duration::from_secs(last_ok))
    }

    /// Close every idle pooled connection and refuse further checkouts.
    ///
    /// Connections in use finish their request and are dropped on checkin.
    /// Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        let closed = self.pool.shutdown(|conn| conn.finish());
        debug!(name = %self.name(), closed, "Client shut down");
        closed
    }

    /// Invalidate every pooled connection's routing.
    pub fn reconnect(&self) {
        let _settings = self.settings.write();
        let generation = self.routing_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "Routing generation bumped");
    }

    /// Force every pooled connection to redo its TLS setup.
    pub fn reconnect_tls(&self) {
        self.update_tls(|_| {});
    }

    /// Route requests through `proxy`, or go direct with `None`.
    pub fn set_proxy(&self, proxy: Option<ProxyTarget>) {
        let mut settings = self.settings.write();
        settings.proxy = proxy;
        let generation = self.routing_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, proxied = settings.proxy.is_some(), "Proxy changed");
    }

    /// Replace all TLS settings.
    pub fn set_tls(&self, tls: TlsSettings) {
        self.update_tls(|settings| *settings = tls);
    }

    /// Set the client certificate chain.
    pub fn set_certificate(&self, chain: Vec<CertificateDer<'static>>) {
        self.update_tls(|settings| settings.certificate = Some(chain));
    }

    /// Set the client private key.
    pub fn set_private_key(&self, key: PrivateKeyDer<'static>) {
        self.update_tls(|settings| settings.private_key = Some(key));
    }

    /// Set a PEM file of extra trusted roots.
    pub fn set_ca_file(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.update_tls(|settings| settings.ca_file = Some(path));
    }

    /// Set a directory of PEM files with extra trusted roots.
    pub fn set_ca_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.update_tls(|settings| settings.ca_path = Some(path));
    }

    /// Replace the bundled trusted roots.
    pub fn set_cert_store(&self, store: Arc<RootCertStore>) {
        self.update_tls(|settings| settings.cert_store = Some(store));
    }

    /// Restrict cipher suites by name.
    pub fn set_ciphers(&self, ciphers: Vec<String>) {
        self.update_tls(|settings| settings.ciphers = Some(ciphers));
    }

    /// Set the verification mode.
    pub fn set_verify_mode(&self, mode: VerifyMode) {
        if mode == VerifyMode::None {
            warn!("Server certificate verification disabled");
        }
        self.update_tls(|settings| settings.verify_mode = mode);
    }

    /// Set the maximum number of intermediate certificates.
    pub fn set_verify_depth(&self, depth: usize) {
        self.update_tls(|settings| settings.verify_depth = Some(depth));
    }

    /// Set the certificate verification hook.
    pub fn set_verify_callback(&self, callback: VerifyCallback) {
        self.update_tls(|settings| settings.verify_callback = Some(callback));
    }

    /// Pin the TLS version.
    pub fn set_ssl_version(&self, version: TlsVersion) {
        self.update_tls(|settings| settings.ssl_version = Some(version));
    }

    /// Set the lowest TLS version offered.
    pub fn set_min_version(&self, version: TlsVersion) {
        self.update_tls(|settings| settings.min_version = Some(version));
    }

    /// Set the highest TLS version offered.
    pub fn set_max_version(&self, version: TlsVersion) {
        self.update_tls(|settings| settings.max_version = Some(version));
    }

    /// Set the TLS handshake deadline.
    pub fn set_ssl_timeout(&self, timeout: Duration) {
        self.update_tls(|settings| settings.ssl_timeout = Some(timeout));
    }

    /// Set the idle timeout. `None` disables it.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().idle_timeout = timeout;
    }

    /// Set the request limit per connection. `None` removes it.
    pub fn set_max_requests(&self, max: Option<u64>) {
        self.settings.write().max_requests = max;
    }

    /// Set the read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().read_timeout = timeout;
    }

    /// Set the connect timeout.
    pub fn set_open_timeout(&self, timeout: Option<Duration>) {
        self.settings.write().open_timeout = timeout;
    }

    /// Set the advertised keep-alive duration.
    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.settings.write().keep_alive = keep_alive;
    }

    /// Enable or disable retrying non-idempotent requests.
    pub fn set_retry_non_idempotent(&self, enable: bool) {
        self.settings.write().retry_non_idempotent = enable;
    }

    /// Add a header sent with every request.
    pub fn add_default_header(&self, name: HeaderName, value: HeaderValue) {
        self.settings.write().default_headers.append(name, value);
    }

    /// Force a header onto every request.
    pub fn set_override_header(&self, name: HeaderName, value: HeaderValue) {
        self.settings.write().override_headers.insert(name, value);
    }

    /// Set options for sockets opened from now on.
    pub fn set_socket_options(&self, options: SocketOptions) {
        self.settings.write().socket_options = options;
    }

    fn update_tls<F>(&self, apply: F)
    where
        F: FnOnce(&mut TlsSettings),
    {
        let mut settings = self.settings.write();
        apply(&mut settings.tls);
        let generation = self.tls_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "TLS generation bumped");
    }

    async fn execute(
        &self,
        caller: CallerId,
        mut request: Request<Bytes>,
        mut sink: Option<&mut BodySink<'_>>,
    ) -> Result<Response> {
        let target = Target::from_uri(request.uri())?;
        self.apply_headers(&mut request, &target)?;

        let retry_non_idempotent = self.settings.read().retry_non_idempotent;
        let mut retry = RetryState::new(can_retry(request.method(), retry_non_idempotent));
        let closes = has_token(request.headers(), "close");

        let mut conn = self.checkout(caller, &target).await?;

        loop {
            if !conn.is_open() {
                self.start(&mut conn).await?;
            }

            conn.request_count += 1;
            let result = conn
                .transport
                .send(clone_request(&request), sink.as_deref_mut())
                .await;
            let now = Instant::now();

            let err = match result {
                Ok(response) => {
                    if closes || response.ends_connection() {
                        trace!(authority = %target.authority(), "Connection closed after response");
                        conn.finish();
                    }
                    self.record_version(&target, response.version());
                    conn.last_used = Some(now);
                    return Ok(response);
                }
                Err(err) => err,
            };

            match err.class() {
                FailureClass::BadResponse => {
                    let diagnostics = conn.diagnostics(now);
                    conn.finish();
                    conn.last_used = Some(now);

                    match retry.on_bad_response() {
                        Attempt::Retry => {
                            debug!(
                                method = %request.method(),
                                error = %err,
                                "Bad response, retrying on a fresh connection"
                            );
                        }
                        Attempt::GiveUp => return Err(Error::TooManyBadResponses { diagnostics }),
                    }
                }
                FailureClass::Transient => {
                    let diagnostics = conn.diagnostics(now);

                    match retry.on_transient_failure() {
                        Attempt::Retry => {
                            debug!(
                                method = %request.method(),
                                error = %err,
                                %diagnostics,
                                "Connection failed, resetting and retrying"
                            );
                            conn.last_used = Some(now);
                            self.reset(&mut conn).await?;
                        }
                        Attempt::GiveUp => {
                            conn.finish();
                            conn.last_used = Some(now);
                            return Err(Error::TooManyConnectionResets {
                                source: err,
                                diagnostics,
                            });
                        }
                    }
                }
                FailureClass::Fatal => {
                    conn.finish();
                    conn.last_used = Some(now);
                    return Err(Error::Transport(err));
                }
            }
        }
    }

    /// Route `target` for `caller`: the pool key and the transport
    /// destination.
    fn route(&self, caller: CallerId, target: &Target) -> (PoolKey, Destination) {
        let settings = self.settings.read();
        let routing_generation = self.routing_generation.load(Ordering::Acquire);

        let proxy = settings
            .proxy
            .as_ref()
            .filter(|proxy| !proxy.bypass(&target.host, target.port))
            .cloned();

        let key = PoolKey {
            caller,
            tls: target.tls,
            host: target.host.clone(),
            port: target.port,
            proxy: proxy.as_ref().map(ProxyTarget::identity),
            routing_generation,
        };
        let destination = Destination {
            host: target.host.clone(),
            port: target.port,
            tls: target.tls,
            proxy,
        };
        (key, destination)
    }

    /// Check out and validate the connection for `caller` and `target`.
    async fn checkout(&self, caller: CallerId, target: &Target) -> Result<Lease<'_, C::Transport>> {
        let mut conn = self.lease(caller, target).await?;
        self.validate(&mut conn).await?;
        Ok(conn)
    }

    /// Check out the connection for `caller` and `target` as is.
    async fn lease(&self, caller: CallerId, target: &Target) -> Result<Lease<'_, C::Transport>> {
        let (key, destination) = self.route(caller, target);
        trace!(key = %key, "Checking out connection");

        let tls_generation = self.tls_generation();
        let connector = &self.connector;
        let conn = self
            .pool
            .checkout(key, || {
                Connection::new(
                    connector.create(&destination),
                    destination.host.clone(),
                    destination.port,
                    destination.tls,
                    tls_generation,
                )
            })
            .await?;
        Ok(conn)
    }

    async fn validate(&self, conn: &mut Connection<C::Transport>) -> Result<()> {
        let (max_requests, idle_timeout) = {
            let settings = self.settings.read();
            let current = self.tls_generation.load(Ordering::Acquire);

            if conn.tls_generation != current {
                debug!(
                    address = %conn.address,
                    port = conn.port,
                    from = conn.tls_generation,
                    to = current,
                    "TLS settings changed, reconfiguring connection"
                );
                // A live session keeps its old parameters; `start` applies
                // the current ones.
                if conn.is_open() {
                    conn.finish();
                }
                conn.tls_generation = current;
            }

            conn.transport.set_timeouts(&Timeouts {
                open: settings.open_timeout,
                read: settings.read_timeout,
            });

            (settings.max_requests, settings.idle_timeout)
        };

        if !conn.is_open() {
            self.start(conn).await
        } else if conn.is_expired(max_requests, idle_timeout, Instant::now()) {
            debug!(
                address = %conn.address,
                port = conn.port,
                requests = conn.request_count,
                "Connection expired, resetting"
            );
            self.reset(conn).await
        } else {
            Ok(())
        }
    }

    /// Configure and open a closed connection.
    async fn start(&self, conn: &mut Connection<C::Transport>) -> Result<()> {
        {
            let settings = self.settings.read();
            if conn.tls {
                conn.transport
                    .configure_tls(&settings.tls)
                    .map_err(Error::Transport)?;
            }
            conn.transport.set_socket_options(&settings.socket_options);
        }

        conn.transport
            .start()
            .await
            .map_err(|err| connect_error(conn, err))
    }

    /// Close and reopen a connection in place.
    async fn reset(&self, conn: &mut Connection<C::Transport>) -> Result<()> {
        conn.finish();
        self.start(conn).await
    }

    fn apply_headers(&self, request: &mut Request<Bytes>, target: &Target) -> Result<()> {
        let settings = self.settings.read();
        let headers = request.headers_mut();

        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(&target.host_header())
                .map_err(|e| Error::RequestBuild(e.to_string()))?;
            headers.insert(HOST, host);
        }

        for (name, value) in &settings.default_headers {
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &settings.override_headers {
            headers.insert(name.clone(), value.clone());
        }

        if !headers.contains_key(CONNECTION) {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        if !headers.contains_key(&KEEP_ALIVE) {
            headers.insert(
                KEEP_ALIVE,
                HeaderValue::from(settings.keep_alive.as_secs()),
            );
        }
        Ok(())
    }

    fn record_version(&self, target: &Target, version: Version) {
        self.http_versions
            .write()
            .entry(target.authority())
            .or_insert(version);
    }
}

impl<C: Connector> std::fmt::Debug for PersistentHttpClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentHttpClient")
            .field("name", &self.settings.read().name)
            .field("tls_generation", &self.tls_generation())
            .field("routing_generation", &self.routing_generation())
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

/// Surface refused and unreachable connects with the destination named.
fn connect_error<T>(conn: &Connection<T>, err: TransportError) -> Error {
    if err.is_connection_refused() {
        Error::ConnectionRefused {
            address: conn.address.clone(),
            port: conn.port,
        }
    } else if err.is_host_down() {
        Error::HostDown {
            address: conn.address.clone(),
            port: conn.port,
        }
    } else {
        Error::Transport(err)
    }
}

fn parse_uri(url: &str) -> Result<Uri> {
    let url = Url::parse(url)?;
    url.as_str()
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::InvalidUrl(e.to_string()))
}

/// Copy a request for another attempt. Extensions are not carried over.
fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
