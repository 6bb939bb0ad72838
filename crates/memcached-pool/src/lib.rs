//! memcached-pool — bounded connection pooling for memcached binary-protocol servers.
//!
//! - **pool**: [`ConnectionPool`] with a bounded ready-queue, overflow capacity,
//!   timed acquisition and TAP feed detachment; generic over [`Connection`]
//! - **client**: [`MemcachedClient`], the default connection (TCP/TLS transport,
//!   SASL `PLAIN`, TAP streams) and its [`TcpConnectionFactory`]
//! - **auth**: credential providers handed to the factory
//! - **config**: `pool.toml` parsing into [`PoolConfig`] and transport options
//! - **error**: [`PoolError`] and [`ClientError`]
//!
//! ```no_run
//! use std::sync::Arc;
//! use memcached_pool::{BasicAuth, ConnectionPool};
//!
//! # async fn run() -> Result<(), memcached_pool::PoolError> {
//! let pool = ConnectionPool::new("cache.internal:11210", Arc::new(BasicAuth::new("app", "pw")), 16, 8);
//! let mut conn = pool.get().await?;
//! conn.noop()?;
//! pool.return_connection(conn);
//! pool.close();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;

pub use auth::{Anonymous, AuthHandler, BasicAuth};
pub use client::tap::{TapArguments, TapEvent, TapEventKind, TapFeed};
pub use client::transport::{TlsConfig, TransportOptions};
pub use client::{MemcachedClient, TcpConnectionFactory};
pub use config::PoolFileConfig;
pub use error::{ClientError, PoolError, PoolResult};
pub use pool::{Connection, ConnectionFactory, ConnectionPool, MaybePool, PoolConfig, PoolStats};
