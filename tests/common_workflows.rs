//! Integration tests for common keepalive workflows.
//!
//! These tests exercise the public surface re-exported by the root crate.

use keepalive::prelude::*;
use keepalive::{ConnectionPool, PoolConfig, PoolError, TlsVersion};
use std::time::Duration;

// =============================================================================
// Pool Tests
// =============================================================================

#[tokio::test]
async fn test_pool_lends_one_connection_per_key() {
    let pool: ConnectionPool<(CallerId, &str), u32> = ConnectionPool::new(
        PoolConfig::builder()
            .capacity(2)
            .checkout_timeout(Duration::from_millis(50))
            .build(),
    );
    let caller = CallerId::new();

    {
        let mut conn = pool.checkout((caller, "example.com:80"), || 0).await.unwrap();
        *conn += 1;
    }

    let conn = pool.checkout((caller, "example.com:80"), || 0).await.unwrap();
    assert_eq!(*conn, 1);
    assert_eq!(pool.status().checked_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_times_out_when_saturated() {
    let pool: ConnectionPool<u8, ()> = ConnectionPool::new(
        PoolConfig::builder()
            .capacity(1)
            .checkout_timeout(Duration::from_secs(1))
            .build(),
    );

    let _held = pool.checkout(1, || ()).await.unwrap();
    let err = pool.checkout(2, || ()).await.unwrap_err();

    assert_eq!(err, PoolError::Timeout(Duration::from_secs(1)));
}

// =============================================================================
// Client Configuration Tests
// =============================================================================

#[test]
fn test_client_setters_and_generations() {
    let client = PersistentHttpClient::new(
        ClientConfig::builder()
            .name("workflows")
            .idle_timeout(None)
            .build(),
    );

    assert_eq!(client.name(), "workflows");
    assert_eq!(client.tls_generation(), 0);

    client.set_verify_mode(VerifyMode::Peer);
    client.set_min_version(TlsVersion::Tls13);
    assert_eq!(client.tls_generation(), 2);

    client.set_proxy(Some(ProxyTarget::new("proxy.local", 3128)));
    client.reconnect();
    assert_eq!(client.routing_generation(), 2);

    client.set_idle_timeout(Some(Duration::ZERO));
    assert_eq!(client.config().idle_timeout, Some(Duration::ZERO));
}

#[test]
fn test_tls_settings_compile() {
    let settings = TlsSettings {
        min_version: Some(TlsVersion::Tls12),
        ssl_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    assert!(settings.client_config().is_ok());
    assert_eq!(settings.handshake_timeout(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_shutdown_client_refuses_requests() {
    let client = PersistentHttpClient::default();
    assert_eq!(client.shutdown(), 0);

    let err = client
        .get(CallerId::new(), "http://127.0.0.1:9/")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
}
