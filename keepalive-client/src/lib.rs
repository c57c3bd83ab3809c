//! # Keepalive Client
//!
//! Persistent HTTP/1.1 connections shared by many concurrent callers.
//!
//! ## Features
//!
//! - **Keep-Alive Reuse**: One pooled connection per caller and destination
//! - **Staleness Detection**: Idle timeout and request limits reset connections before use
//! - **Lazy Invalidation**: TLS and proxy changes bump generation counters checked at checkout
//! - **Bounded Retries**: At most one retry per failure class, idempotent methods only by default
//! - **Proxy Routing**: HTTP proxies, `CONNECT` tunnels and no-proxy suffixes
//! - **Pluggable Transport**: hyper + rustls by default, any [`Connector`] in tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keepalive_client::{CallerId, ClientConfig, PersistentHttpClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PersistentHttpClient::new(
//!         ClientConfig::builder()
//!             .idle_timeout(Some(Duration::from_secs(10)))
//!             .max_requests(100)
//!             .build(),
//!     );
//!
//!     let caller = CallerId::new();
//!     let response = client.get(caller, "https://example.com/").await?;
//!     println!("Status: {}", response.status());
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Changing TLS Settings
//!
//! ```rust,no_run
//! use keepalive_client::{PersistentHttpClient, VerifyMode};
//!
//! let client = PersistentHttpClient::default();
//!
//! // Existing connections are reconfigured the next time they are used.
//! client.set_verify_mode(VerifyMode::None);
//! assert_eq!(client.tls_generation(), 1);
//! ```

mod client;
mod config;
mod connection;
mod error;
mod key;
pub mod logging;
mod proxy;
mod response;
mod retry;
mod tls;
mod transport;

pub use client::PersistentHttpClient;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::{Connection, ConnectionDiagnostics};
pub use error::{Error, Result};
pub use key::{CallerId, PoolKey};
pub use proxy::ProxyTarget;
pub use response::Response;
pub use retry::{Attempt, RetryState, can_retry, is_idempotent};
pub use tls::{
    TlsSettings, TlsVersion, VerifyCallback, VerifyMode, load_certs, load_private_key,
    parse_certs, parse_private_key,
};
pub use transport::{
    BodySink, Connector, Destination, FailureClass, HyperConnector, HyperTransport,
    SocketOptions, Timeouts, Transport, TransportError,
};

pub use keepalive_pool::PoolStatus;
