// Keepalive - persistent HTTP connections for many concurrent callers
//
// Connections are pooled per caller and destination, validated against TLS
// and routing generations on checkout, and retried at most once per failure
// class.

// Re-export the client
pub use keepalive_client::*;

// Re-export the pool
pub use keepalive_pool;
pub use keepalive_pool::{ConnectionPool, PoolConfig, PoolConfigBuilder, PoolError};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::{
        CallerId,
        ClientConfig,
        Error,
        PersistentHttpClient,
        ProxyTarget,
        Response,
        Result,
        TlsSettings,
        VerifyMode,
    };
}
