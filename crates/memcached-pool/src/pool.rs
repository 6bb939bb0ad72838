//! Bounded pool of reusable connections to a single host.
//!
//! A pool keeps a ready-queue of idle connections (at most `pool_size`) and a
//! capacity semaphore with `pool_size + pool_overflow` permits. One permit is
//! held for every live connection wherever it currently is: queued, checked
//! out, or not yet retired. Connections beyond the ready-queue's capacity are
//! overflow connections; they are closed the moment they are returned.
//!
//! # Acquisition
//!
//! ```text
//! get_with_timeout(d)
//!   → wait ~1ms for an idle connection           → reuse it
//!   → race for up to d:
//!       idle connection arrives                  → reuse it
//!       capacity permit frees up                 → build one via the factory
//!       d elapses                                → PoolError::Timeout
//! ```
//!
//! Idle connections are not re-validated when handed out; liveness is checked
//! when a connection is returned.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, SemaphorePermit};

use crate::auth::AuthHandler;
use crate::client::tap::TapArguments;
use crate::client::{MemcachedClient, TcpConnectionFactory};
use crate::error::{ClientError, PoolError, PoolResult};

/// Default acquisition timeout: effectively unbounded (30 days).
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// How long `get` waits for an idle connection before racing to build one.
pub const FAST_PATH_GRACE: Duration = Duration::from_millis(1);

/// A connection the pool can manage.
///
/// Ownership moves explicitly: pool to caller on acquisition, caller to pool
/// on [`ConnectionPool::return_connection`], or caller to a feed consumer on
/// [`Connection::start_tap_feed`].
pub trait Connection: Send + Sized + 'static {
    /// Handle to the long-lived stream started by `start_tap_feed`.
    type Feed: Send;

    /// Cheap liveness check. Must not block.
    fn is_healthy(&self) -> bool;

    /// Close the connection. Calling it twice is harmless.
    fn close(&mut self);

    /// Turn this connection into a TAP feed. On failure the connection must
    /// already be closed.
    fn start_tap_feed(self, args: &TapArguments) -> Result<Self::Feed, ClientError>;
}

/// Builds new connections for a pool.
pub trait ConnectionFactory<C>: Send + Sync {
    fn connect(&self, host: &str, auth: &dyn AuthHandler) -> Result<C, ClientError>;
}

impl<C, F> ConnectionFactory<C> for F
where
    F: Fn(&str, &dyn AuthHandler) -> Result<C, ClientError> + Send + Sync,
{
    fn connect(&self, host: &str, auth: &dyn AuthHandler) -> Result<C, ClientError> {
        self(host, auth)
    }
}

/// Configuration for a connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Capacity of the ready-queue of idle connections (default: 64).
    pub pool_size: usize,
    /// Connections allowed beyond `pool_size` (default: 64).
    pub pool_overflow: usize,
    /// Timeout used by [`ConnectionPool::get`] (default: 30 days).
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            pool_overflow: 64,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn new(pool_size: usize, pool_overflow: usize) -> Self {
        Self {
            pool_size,
            pool_overflow,
            ..Self::default()
        }
    }

    /// Upper bound on live connections.
    pub fn capacity(&self) -> usize {
        self.pool_size
            .saturating_add(self.pool_overflow)
            .min(Semaphore::MAX_PERMITS)
    }
}

/// Point-in-time view of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections sitting in the ready-queue.
    pub idle: usize,
    /// Connections holding a capacity permit (idle + checked out).
    pub live: usize,
    /// Maximum number of live connections.
    pub capacity: usize,
    pub closed: bool,
}

struct ReadyQueue<C> {
    idle: VecDeque<C>,
    closed: bool,
}

/// A bounded pool of connections to one host.
///
/// Safe to share between tasks (wrap in an [`Arc`]); all methods take `&self`.
pub struct ConnectionPool<C: Connection = MemcachedClient> {
    host: String,
    auth: Arc<dyn AuthHandler>,
    factory: Arc<dyn ConnectionFactory<C>>,
    config: PoolConfig,
    /// Idle connections plus the open/closed flag, guarded together.
    ready: Mutex<ReadyQueue<C>>,
    /// Signalled when a connection is queued or the pool closes.
    available: Notify,
    /// One permit per live connection.
    capacity: Semaphore,
}

impl ConnectionPool<MemcachedClient> {
    /// Create a pool of memcached connections using the default TCP factory.
    pub fn new(
        host: impl Into<String>,
        auth: Arc<dyn AuthHandler>,
        pool_size: usize,
        pool_overflow: usize,
    ) -> Self {
        Self::with_factory(
            host,
            auth,
            PoolConfig::new(pool_size, pool_overflow),
            Arc::new(TcpConnectionFactory::default()),
        )
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn with_factory(
        host: impl Into<String>,
        auth: Arc<dyn AuthHandler>,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Self {
        Self {
            host: host.into(),
            auth,
            factory,
            ready: Mutex::new(ReadyQueue {
                idle: VecDeque::with_capacity(config.pool_size.min(1024)),
                closed: false,
            }),
            available: Notify::new(),
            capacity: Semaphore::new(config.capacity()),
            config,
        }
    }

    /// Replace the connection factory.
    pub fn set_factory(&mut self, factory: Arc<dyn ConnectionFactory<C>>) {
        self.factory = factory;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.ready.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let ready = self.ready.lock();
        PoolStats {
            idle: ready.idle.len(),
            live: self.live(),
            capacity: self.config.capacity(),
            closed: ready.closed,
        }
    }

    fn live(&self) -> usize {
        self.config
            .capacity()
            .saturating_sub(self.capacity.available_permits())
    }

    /// Acquire a connection, waiting up to the configured `acquire_timeout`.
    pub async fn get(&self) -> PoolResult<C> {
        self.get_with_timeout(self.config.acquire_timeout).await
    }

    /// Acquire a connection, waiting up to `timeout`.
    pub async fn get_with_timeout(&self, timeout: Duration) -> PoolResult<C> {
        if let Ok(idle) = tokio::time::timeout(FAST_PATH_GRACE, self.next_idle()).await {
            return idle;
        }

        tokio::select! {
            idle = self.next_idle() => idle,
            permit = self.capacity.acquire() => {
                let permit = permit.map_err(|_| PoolError::Closed)?;
                self.create(permit)
            }
            () = tokio::time::sleep(timeout) => {
                tracing::debug!(
                    host = %self.host,
                    timeout = ?timeout,
                    "timed out waiting for connection"
                );
                Err(PoolError::Timeout(timeout))
            }
        }
    }

    /// Wait for an idle connection, or fail once the pool is closed.
    async fn next_idle(&self) -> PoolResult<C> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent return or close is not missed.
            notified.as_mut().enable();

            {
                let mut ready = self.ready.lock();
                if let Some(conn) = ready.idle.pop_front() {
                    let idle_count = ready.idle.len();
                    drop(ready);
                    tracing::debug!(host = %self.host, idle_count, "reused idle connection");
                    return Ok(conn);
                }
                if ready.closed {
                    return Err(PoolError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Build a connection against an already-acquired permit. The permit is
    /// kept on success and released on failure.
    fn create(&self, permit: SemaphorePermit<'_>) -> PoolResult<C> {
        match self.factory.connect(&self.host, self.auth.as_ref()) {
            Ok(conn) => {
                permit.forget();
                tracing::debug!(
                    host = %self.host,
                    live = self.live(),
                    "created new connection"
                );
                Ok(conn)
            }
            Err(err) => {
                tracing::warn!(host = %self.host, error = %err, "failed to create connection");
                Err(err.into())
            }
        }
    }

    /// Hand a connection back to the pool.
    ///
    /// Unhealthy connections and connections that do not fit in the
    /// ready-queue are closed and their permit released. Never blocks.
    pub fn return_connection(&self, conn: C) {
        if !conn.is_healthy() {
            self.retire(conn, "unhealthy");
            return;
        }

        let mut ready = self.ready.lock();
        if ready.closed {
            drop(ready);
            self.retire(conn, "pool closed");
        } else if ready.idle.len() < self.config.pool_size {
            ready.idle.push_back(conn);
            let idle = ready.idle.len();
            drop(ready);
            self.available.notify_one();
            tracing::debug!(host = %self.host, idle_count = idle, "returned connection to pool");
        } else {
            drop(ready);
            self.retire(conn, "overflow");
        }
    }

    fn retire(&self, mut conn: C, reason: &'static str) {
        // Close before releasing so the live count never exceeds capacity.
        conn.close();
        self.capacity.add_permits(1);
        tracing::debug!(host = %self.host, reason, live = self.live(), "retired connection");
    }

    /// Acquire a connection and start a TAP feed on it.
    ///
    /// The connection leaves pool accounting for good: its permit is released
    /// without queueing or closing it, and the feed becomes its sole owner.
    pub async fn start_tap_feed(&self, args: &TapArguments) -> PoolResult<C::Feed> {
        let conn = self.get().await?;
        self.capacity.add_permits(1);
        tracing::debug!(host = %self.host, live = self.live(), "detached connection for tap feed");
        Ok(conn.start_tap_feed(args)?)
    }

    /// Close the pool and every idle connection in it.
    ///
    /// Waiters fail with [`PoolError::Closed`]; checked-out connections are
    /// closed when they are returned. Closing twice is a no-op.
    pub fn close(&self) {
        let drained: Vec<C> = {
            let mut ready = self.ready.lock();
            if ready.closed {
                return;
            }
            ready.closed = true;
            ready.idle.drain(..).collect()
        };

        self.capacity.close();
        self.available.notify_waiters();

        let closed_idle = drained.len();
        for mut conn in drained {
            conn.close();
        }
        self.capacity.add_permits(closed_idle);

        tracing::info!(host = %self.host, closed_idle, "connection pool closed");
    }
}

impl<C: Connection> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Pool operations on a pool reference that may be absent.
///
/// Acquisition fails with [`PoolError::NoPool`]; returning and closing are
/// no-ops.
pub trait MaybePool<C: Connection> {
    fn get(self) -> impl Future<Output = PoolResult<C>> + Send;

    fn get_with_timeout(self, timeout: Duration) -> impl Future<Output = PoolResult<C>> + Send;

    fn return_connection(self, conn: Option<C>);

    fn start_tap_feed(
        self,
        args: &TapArguments,
    ) -> impl Future<Output = PoolResult<C::Feed>> + Send;

    fn close(self);
}

impl<C: Connection> MaybePool<C> for Option<&ConnectionPool<C>> {
    fn get(self) -> impl Future<Output = PoolResult<C>> + Send {
        async move {
            match self {
                Some(pool) => pool.get().await,
                None => Err(PoolError::NoPool),
            }
        }
    }

    fn get_with_timeout(self, timeout: Duration) -> impl Future<Output = PoolResult<C>> + Send {
        async move {
            match self {
                Some(pool) => pool.get_with_timeout(timeout).await,
                None => Err(PoolError::NoPool),
            }
        }
    }

    fn return_connection(self, conn: Option<C>) {
        if let (Some(pool), Some(conn)) = (self, conn) {
            pool.return_connection(conn);
        }
    }

    fn start_tap_feed(
        self,
        args: &TapArguments,
    ) -> impl Future<Output = PoolResult<C::Feed>> + Send {
        async move {
            match self {
                Some(pool) => pool.start_tap_feed(args).await,
                None => Err(PoolError::NoPool),
            }
        }
    }

    fn close(self) {
        if let Some(pool) = self {
            pool.close();
        }
    }
}
