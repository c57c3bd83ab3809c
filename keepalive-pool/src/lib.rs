//! # Keepalive Pool
//!
//! A keyed, bounded connection pool. Each key lends out at most one
//! connection at a time, the total number of pooled connections never
//! exceeds the configured capacity, and callers wait (up to a timeout)
//! when the pool is saturated instead of creating extra connections.
//!
//! ## Quick Start
//!
//! ```rust
//! use keepalive_pool::{ConnectionPool, PoolConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keepalive_pool::PoolError> {
//!     let pool: ConnectionPool<&str, Vec<u8>> = ConnectionPool::new(
//!         PoolConfig::builder()
//!             .capacity(4)
//!             .checkout_timeout(Duration::from_secs(1))
//!             .build(),
//!     );
//!
//!     {
//!         let mut conn = pool.checkout("example.com:443", Vec::new).await?;
//!         conn.push(1);
//!     } // checked back in here
//!
//!     let conn = pool.checkout("example.com:443", Vec::new).await?;
//!     assert_eq!(*conn, vec![1]);
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod pool;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{PoolError, Result};
pub use pool::{Checkout, ConnectionPool, PoolStatus};
