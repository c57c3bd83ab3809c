//! Client configuration.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use keepalive_pool::PoolConfig;
use std::time::Duration;

use crate::{ProxyTarget, SocketOptions, TlsSettings};

/// Persistent client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name used in log output.
    pub name: String,
    /// Pool capacity and checkout timeout.
    pub pool: PoolConfig,
    /// Reset connections idle for longer than this. `None` disables the
    /// check, zero resets before every request.
    pub idle_timeout: Option<Duration>,
    /// Reset connections after this many requests.
    pub max_requests: Option<u64>,
    /// Deadline for each response read.
    pub read_timeout: Option<Duration>,
    /// Deadline for connecting.
    pub open_timeout: Option<Duration>,
    /// Value advertised in the `Keep-Alive` request header.
    pub keep_alive: Duration,
    /// Retry POST and other non-idempotent requests too.
    pub retry_non_idempotent: bool,
    /// Headers added to every request unless it already has them.
    pub default_headers: HeaderMap,
    /// Headers forced onto every request.
    pub override_headers: HeaderMap,
    /// Options applied to every new socket.
    pub socket_options: SocketOptions,
    /// Proxy for plain and TLS traffic.
    pub proxy: Option<ProxyTarget>,
    /// TLS parameters for HTTPS destinations.
    pub tls: TlsSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "keepalive".to_string(),
            pool: PoolConfig::default(),
            idle_timeout: Some(Duration::from_secs(5)),
            max_requests: None,
            read_timeout: None,
            open_timeout: None,
            keep_alive: Duration::from_secs(30),
            retry_non_idempotent: false,
            default_headers: HeaderMap::new(),
            override_headers: HeaderMap::new(),
            socket_options: SocketOptions::default(),
            proxy: None,
            tls: TlsSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for client configuration.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the client name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the maximum number of pooled connections.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool.capacity = capacity.max(1);
        self
    }

    /// Set how long a request waits for a pooled connection.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.checkout_timeout = timeout;
        self
    }

    /// Set the idle timeout. `None` disables it.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the maximum requests per connection.
    pub fn max_requests(mut self, max: u64) -> Self {
        self.config.max_requests = Some(max);
        self
    }

    /// Set the read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = Some(timeout);
        self
    }

    /// Set the advertised keep-alive duration.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Enable or disable retrying non-idempotent requests.
    pub fn retry_non_idempotent(mut self, enable: bool) -> Self {
        self.config.retry_non_idempotent = enable;
        self
    }

    /// Add a default header.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.default_headers.append(name, value);
        self
    }

    /// Add an override header.
    pub fn override_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.override_headers.insert(name, value);
        self
    }

    /// Set socket options.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.config.socket_options = options;
        self
    }

    /// Route requests through a proxy.
    pub fn proxy(mut self, proxy: ProxyTarget) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Set TLS parameters.
    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.config.tls = tls;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::USER_AGENT;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(config.max_requests.is_none());
        assert!(!config.retry_non_idempotent);
        assert!(config.socket_options.nodelay);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .name("probe")
            .pool_capacity(0)
            .idle_timeout(None)
            .max_requests(100)
            .retry_non_idempotent(true)
            .default_header(USER_AGENT, HeaderValue::from_static("probe/1.0"))
            .proxy(ProxyTarget::new("proxy", 3128))
            .build();

        assert_eq!(config.name, "probe");
        assert_eq!(config.pool.capacity, 1);
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.max_requests, Some(100));
        assert!(config.retry_non_idempotent);
        assert_eq!(config.default_headers[USER_AGENT], "probe/1.0");
        assert_eq!(config.proxy.map(|p| p.port), Some(3128));
    }
}
