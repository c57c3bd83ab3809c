//! Keyed connection pool.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{PoolConfig, PoolError, Result};

/// A pool entry: either an idle connection or a marker for a lent one.
enum Slot<C> {
    Idle { conn: C, returned_at: u64 },
    CheckedOut,
}

/// Outcome of trying to lend the connection for a key.
enum Lease<C> {
    /// The key's idle connection.
    Ready(C),
    /// A slot was reserved for a new connection, possibly by evicting an
    /// idle one for another key.
    Vacant { evicted: Option<C> },
    /// The key is lent out or every slot is in use.
    Busy,
}

struct PoolState<K, C> {
    entries: HashMap<K, Slot<C>>,
    checked_out: usize,
    closed: bool,
    /// Checkin counter, used to find the least recently returned entry.
    clock: u64,
}

impl<K: Eq + Hash + Clone, C> PoolState<K, C> {
    fn lease(&mut self, key: &K, capacity: usize) -> Lease<C> {
        if let Some(slot) = self.entries.get_mut(key) {
            return match std::mem::replace(slot, Slot::CheckedOut) {
                Slot::Idle { conn, .. } => {
                    self.checked_out += 1;
                    Lease::Ready(conn)
                }
                Slot::CheckedOut => Lease::Busy,
            };
        }

        let mut evicted = None;
        if self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Idle { returned_at, .. } => Some((key, *returned_at)),
                    Slot::CheckedOut => None,
                })
                .min_by_key(|(_, returned_at)| *returned_at)
                .map(|(key, _)| key.clone());

            match oldest.and_then(|stale| self.entries.remove(&stale)) {
                Some(Slot::Idle { conn, .. }) => evicted = Some(conn),
                _ => return Lease::Busy,
            }
        }

        self.entries.insert(key.clone(), Slot::CheckedOut);
        self.checked_out += 1;
        Lease::Vacant { evicted }
    }

    fn idle_count(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, Slot::Idle { .. }))
            .count()
    }
}

/// Keyed, bounded connection pool.
///
/// Every key lends at most one connection at a time. The number of
/// entries, idle or checked out, never exceeds the configured capacity:
/// when a new key needs room the least recently returned idle entry is
/// evicted, and when every entry is checked out callers wait for a
/// checkin until the checkout timeout elapses.
pub struct ConnectionPool<K, C> {
    config: PoolConfig,
    state: Mutex<PoolState<K, C>>,
    available: Notify,
}

impl<K, C> ConnectionPool<K, C>
where
    K: Eq + Hash + Clone,
{
    /// Create a new pool with the given configuration.
    pub fn new(mut config: PoolConfig) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            config,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                checked_out: 0,
                closed: false,
                clock: 0,
            }),
            available: Notify::new(),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out the connection for `key`, building it with `factory` the
    /// first time the key is seen.
    ///
    /// The returned guard checks the connection back in when dropped.
    /// Fails with [`PoolError::Timeout`] when no slot frees up within the
    /// checkout timeout and with [`PoolError::Closed`] after shutdown.
    pub async fn checkout<F>(&self, key: K, factory: F) -> Result<Checkout<'_, K, C>>
    where
        F: FnOnce() -> C,
    {
        let deadline = Instant::now() + self.config.checkout_timeout;

        loop {
            // Register interest before inspecting state so a checkin racing
            // with this attempt still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lease = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                state.lease(&key, self.config.capacity)
            };

            match lease {
                Lease::Ready(conn) => {
                    trace!("Reusing pooled connection");
                    return Ok(Checkout::new(self, key, conn));
                }
                Lease::Vacant { evicted } => {
                    if evicted.is_some() {
                        debug!("Evicted least recently used idle connection");
                    }
                    drop(evicted);
                    trace!("Creating pooled connection");
                    let reservation = Reservation { pool: self, key: &key };
                    let conn = factory();
                    std::mem::forget(reservation);
                    return Ok(Checkout::new(self, key, conn));
                }
                Lease::Busy => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(
                    timeout = ?self.config.checkout_timeout,
                    "Timed out waiting for a pool slot"
                );
                return Err(PoolError::Timeout(self.config.checkout_timeout));
            }
        }
    }

    /// Close every idle connection with `close`, then mark the pool closed.
    ///
    /// Checked-out connections are left alone; they are dropped when their
    /// guards check them in. Returns the number of connections closed.
    pub fn shutdown<F>(&self, mut close: F) -> usize
    where
        F: FnMut(&mut C),
    {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;

            let entries = std::mem::take(&mut state.entries);
            let mut idle = Vec::new();
            for (key, slot) in entries {
                match slot {
                    Slot::Idle { conn, .. } => idle.push(conn),
                    Slot::CheckedOut => {
                        state.entries.insert(key, Slot::CheckedOut);
                    }
                }
            }
            idle
        };

        let count = idle.len();
        for mut conn in idle {
            close(&mut conn);
        }

        self.available.notify_waiters();
        debug!(closed = count, "Connection pool shut down");
        count
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Get pool statistics.
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            capacity: self.config.capacity,
            entries: state.entries.len(),
            idle: state.idle_count(),
            checked_out: state.checked_out,
        }
    }

    fn checkin(&self, key: &K, conn: C) {
        let dropped = {
            let mut state = self.state.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            if state.closed {
                state.entries.remove(key);
                Some(conn)
            } else {
                state.clock += 1;
                let returned_at = state.clock;
                state
                    .entries
                    .insert(key.clone(), Slot::Idle { conn, returned_at });
                None
            }
        };

        drop(dropped);
        self.available.notify_waiters();
    }

    fn remove(&self, key: &K) {
        {
            let mut state = self.state.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            state.entries.remove(key);
        }
        self.available.notify_waiters();
    }
}

impl<K, C> fmt::Debug for ConnectionPool<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Releases a reserved slot if the factory unwinds before the connection
/// exists.
struct Reservation<'a, K, C>
where
    K: Eq + Hash + Clone,
{
    pool: &'a ConnectionPool<K, C>,
    key: &'a K,
}

impl<K, C> Drop for Reservation<'_, K, C>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.pool.remove(self.key);
    }
}

/// A connection lent out by a [`ConnectionPool`].
///
/// Dereferences to the connection and returns it to the pool on drop, so
/// every exit path of the borrower checks the connection back in.
#[derive(Debug)]
pub struct Checkout<'a, K, C>
where
    K: Eq + Hash + Clone,
{
    pool: &'a ConnectionPool<K, C>,
    key: K,
    conn: Option<C>,
}

impl<'a, K, C> Checkout<'a, K, C>
where
    K: Eq + Hash + Clone,
{
    fn new(pool: &'a ConnectionPool<K, C>, key: K, conn: C) -> Self {
        Self {
            pool,
            key,
            conn: Some(conn),
        }
    }

    /// The key this connection was checked out under.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Drop the connection and free its slot instead of checking it in.
    pub fn discard(mut self) {
        let conn = self.conn.take();
        self.pool.remove(&self.key);
        drop(conn);
    }
}

impl<K, C> Deref for Checkout<'_, K, C>
where
    K: Eq + Hash + Clone,
{
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is present until checkin")
    }
}

impl<K, C> DerefMut for Checkout<'_, K, C>
where
    K: Eq + Hash + Clone,
{
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is present until checkin")
    }
}

impl<K, C> Drop for Checkout<'_, K, C>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(&self.key, conn);
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Current number of entries, idle or checked out.
    pub entries: usize,
    /// Number of idle connections.
    pub idle: usize,
    /// Number of checked-out connections.
    pub checked_out: usize,
}

impl PoolStatus {
    /// Get the checked-out share of capacity as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.checked_out as f64 / self.capacity as f64) * 100.0
        }
    }

    /// Check if every slot is checked out.
    pub fn is_saturated(&self) -> bool {
        self.checked_out >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pool(capacity: usize, timeout_ms: u64) -> ConnectionPool<&'static str, u32> {
        ConnectionPool::new(
            PoolConfig::builder()
                .capacity(capacity)
                .checkout_timeout(Duration::from_millis(timeout_ms))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_checkout_builds_lazily_and_reuses() {
        let pool = pool(2, 100);
        let mut built = 0;

        {
            let mut conn = pool
                .checkout("a", || {
                    built += 1;
                    10
                })
                .await
                .unwrap();
            *conn += 1;
        }

        let conn = pool
            .checkout("a", || {
                built += 1;
                0
            })
            .await
            .unwrap();

        assert_eq!(*conn, 11);
        assert_eq!(built, 1);
        assert_eq!(conn.key(), &"a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkout_times_out_when_saturated() {
        let pool = pool(1, 500);
        let _held = pool.checkout("a", || 1).await.unwrap();

        let started = Instant::now();
        let result = pool.checkout("b", || 2).await;

        assert_eq!(result.err(), Some(PoolError::Timeout(Duration::from_millis(500))));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_waits_for_checkin() {
        let pool = Arc::new(pool(4, 1_000));
        let (tx, rx) = oneshot::channel();

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut conn = pool.checkout("a", || 1).await.unwrap();
                tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                *conn = 2;
            })
        };

        rx.await.unwrap();
        let conn = pool.checkout("a", || 99).await.unwrap();
        assert_eq!(*conn, 2);
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_checkout_resumes_after_checkin() {
        let pool = Arc::new(pool(1, 1_000));
        let (tx, rx) = oneshot::channel();

        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let _conn = pool.checkout("a", || 1).await.unwrap();
                tx.send(()).unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
        };

        rx.await.unwrap();
        let conn = pool.checkout("b", || 2).await.unwrap();
        assert_eq!(*conn, 2);
        assert_eq!(pool.status().entries, 1);
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_pool_evicts_least_recently_returned() {
        let pool = pool(2, 100);

        drop(pool.checkout("a", || 1).await.unwrap());
        drop(pool.checkout("b", || 2).await.unwrap());
        drop(pool.checkout("c", || 3).await.unwrap());

        let status = pool.status();
        assert_eq!(status.entries, 2);
        assert_eq!(status.idle, 2);

        // "a" was evicted, so it gets rebuilt.
        let conn = pool.checkout("a", || 100).await.unwrap();
        assert_eq!(*conn, 100);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_only() {
        let pool = pool(4, 100);
        drop(pool.checkout("a", || 1).await.unwrap());
        drop(pool.checkout("b", || 2).await.unwrap());
        let held = pool.checkout("c", || 3).await.unwrap();

        let mut closed = Vec::new();
        let count = pool.shutdown(|conn| closed.push(*conn));
        closed.sort();

        assert_eq!(count, 2);
        assert_eq!(closed, vec![1, 2]);
        assert!(pool.is_closed());
        assert_eq!(*held, 3);
        assert_eq!(pool.status().checked_out, 1);

        drop(held);
        assert_eq!(pool.status().entries, 0);
        assert_eq!(pool.checkout("a", || 1).await.err(), Some(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_panicking_factory_releases_slot() {
        let pool = Arc::new(pool(1, 100));

        let failed = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _conn = pool.checkout("a", || panic!("connect failed")).await;
            })
        };
        assert!(failed.await.unwrap_err().is_panic());

        let status = pool.status();
        assert_eq!(status.entries, 0);
        assert_eq!(status.checked_out, 0);

        let conn = pool.checkout("a", || 7).await.unwrap();
        assert_eq!(*conn, 7);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let pool = pool(1, 100);
        let conn = pool.checkout("a", || 1).await.unwrap();
        conn.discard();

        let status = pool.status();
        assert_eq!(status.entries, 0);
        assert_eq!(status.checked_out, 0);

        let conn = pool.checkout("a", || 7).await.unwrap();
        assert_eq!(*conn, 7);
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            capacity: 4,
            entries: 3,
            idle: 1,
            checked_out: 2,
        };

        assert_eq!(status.utilization(), 50.0);
        assert!(!status.is_saturated());
    }
}
