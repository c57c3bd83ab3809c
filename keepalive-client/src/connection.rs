//! Pooled connection entity.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::Transport;

/// One transport plus the metadata the client uses to judge its health.
///
/// A connection is only ever touched by the caller that has it checked
/// out, so none of its fields need synchronization.
#[derive(Debug)]
pub struct Connection<T> {
    pub(crate) transport: T,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) tls: bool,
    pub(crate) tls_generation: u64,
    pub(crate) request_count: u64,
    pub(crate) last_used: Option<Instant>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(
        transport: T,
        address: String,
        port: u16,
        tls: bool,
        tls_generation: u64,
    ) -> Self {
        Self {
            transport,
            address,
            port,
            tls,
            tls_generation,
            request_count: 0,
            last_used: None,
        }
    }

    /// Destination address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the destination speaks TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// TLS generation the transport was last configured for.
    pub fn tls_generation(&self) -> u64 {
        self.tls_generation
    }

    /// Requests attempted since the transport was last opened.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// When the last request attempt completed.
    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_started()
    }

    /// Whether the connection must be reset before its next use.
    ///
    /// Checked in order: request limit reached, idle timeout disabled,
    /// zero idle timeout, idle for longer than the timeout. A connection
    /// that has never completed a request counts as expired once an idle
    /// timeout is set.
    pub fn is_expired(
        &self,
        max_requests: Option<u64>,
        idle_timeout: Option<Duration>,
        now: Instant,
    ) -> bool {
        if max_requests.is_some_and(|max| self.request_count >= max) {
            return true;
        }

        let Some(idle_timeout) = idle_timeout else {
            return false;
        };

        if idle_timeout.is_zero() {
            return true;
        }

        match self.last_used {
            Some(last_used) => now.saturating_duration_since(last_used) > idle_timeout,
            None => true,
        }
    }

    /// Close the transport and forget usage history.
    pub(crate) fn finish(&mut self) {
        self.transport.finish();
        self.request_count = 0;
        self.last_used = None;
    }

    /// Snapshot for error messages. Take it before stamping `last_used`.
    pub(crate) fn diagnostics(&self, now: Instant) -> ConnectionDiagnostics {
        ConnectionDiagnostics {
            address: self.address.clone(),
            port: self.port,
            requests: self.request_count.saturating_sub(1),
            idle: self
                .last_used
                .map(|last_used| now.saturating_duration_since(last_used)),
        }
    }
}

/// Connection state reported with terminal request errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDiagnostics {
    /// Destination address.
    pub address: String,
    /// Destination port.
    pub port: u16,
    /// Requests that completed before the failing one.
    pub requests: u64,
    /// Time since the previous request, `None` on a fresh connection.
    pub idle: Option<Duration>,
}

impl fmt::Display for ConnectionDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "after {} requests on {}:{}",
            self.requests, self.address, self.port
        )?;
        match self.idle {
            Some(idle) => write!(f, ", last used {:.3}s ago", idle.as_secs_f64()),
            None => write!(f, ", never used"),
        }
    }
}
