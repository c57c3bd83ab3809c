//! Pool keys.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CALLER: AtomicU64 = AtomicU64::new(1);

/// Identity of one caller (task or worker) sharing a client.
///
/// Each caller gets its own connection per destination. Reuse the same id
/// across requests to benefit from keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    /// Allocate a process-unique caller id.
    pub fn new() -> Self {
        Self(NEXT_CALLER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Identity under which a connection is pooled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub(crate) caller: CallerId,
    pub(crate) tls: bool,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// `host:port` of the proxy, `None` when going direct.
    pub(crate) proxy: Option<String>,
    pub(crate) routing_generation: u64,
}

impl PoolKey {
    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection is routed through a proxy.
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}/{}://{}:{}", self.caller, scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        write!(f, " #{}", self.routing_generation)
    }
}
