//! Error types for the connection pool and the memcached client.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::client::protocol::{Opcode, Status};

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by [`ConnectionPool`](crate::pool::ConnectionPool) operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The operation was invoked without a pool.
    #[error("no pool")]
    NoPool,

    /// No connection became available within the requested duration.
    #[error("timeout waiting to build connection (waited {0:?})")]
    Timeout(Duration),

    /// The pool was closed while waiting or returning.
    #[error("the pool is closed")]
    Closed,

    /// Connection creation, authentication or feed start failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors raised while establishing or using a memcached connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("dns resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("tcp connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid tls server name '{0}'")]
    ServerName(String),

    #[error("authentication failed for '{user}': {status}")]
    Auth { user: String, status: Status },

    #[error("auth mechanism PLAIN not supported (server offers: {0})")]
    UnsupportedMechanism(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("{opcode} failed: {status}")]
    Status { opcode: Opcode, status: Status },

    #[error("connection is closed")]
    Closed,
}

impl ClientError {
    /// Whether this error means the transport can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Status { .. } | ClientError::Auth { .. })
    }
}
