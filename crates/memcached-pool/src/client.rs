//! memcached binary-protocol client, the pool's default connection type.
//!
//! [`MemcachedClient`] exchanges raw binary-protocol packets over a
//! [`Transport`](transport::Transport), authenticates with SASL `PLAIN`, and can
//! hand itself over to a TAP stream. [`TcpConnectionFactory`] is the default
//! factory used by [`ConnectionPool::new`](crate::pool::ConnectionPool::new).
//!
//! # Connection setup
//!
//! ```text
//! TcpConnectionFactory::connect(host, auth)
//!   → Transport::connect(host)            (TCP, optional TLS)
//!   → auth.credentials() == "default"?    → done
//!   → SASL_LIST_MECHS, require PLAIN
//!   → SASL_AUTH PLAIN "\0user\0pass"      → failure closes the socket
//! ```

pub mod protocol;
pub mod tap;
pub mod transport;

use std::io::Write;

use self::protocol::{Frame, Opcode, Request, Response, read_frame};
use self::tap::{TapArguments, TapFeed};
use self::transport::{Transport, TransportOptions};
use crate::auth::{AuthHandler, DEFAULT_USER};
use crate::error::ClientError;
use crate::pool::{Connection, ConnectionFactory};

/// A single connection to a memcached server.
#[derive(Debug)]
pub struct MemcachedClient {
    transport: Transport,
    healthy: bool,
    closed: bool,
    next_opaque: u32,
}

impl MemcachedClient {
    /// Open a connection to `host` (`name:port`).
    pub fn connect(host: &str, options: &TransportOptions) -> Result<Self, ClientError> {
        Ok(Self::from_transport(Transport::connect(host, options)?))
    }

    pub fn from_transport(transport: Transport) -> Self {
        Self {
            transport,
            healthy: true,
            closed: false,
            next_opaque: 1,
        }
    }

    /// Write one request. The opaque field is filled in if left at zero.
    pub fn send(&mut self, req: &Request) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        // Rejected before any byte is written, so the stream stays in sync.
        req.validate()?;
        let bytes = if req.opaque == 0 {
            let mut req = req.clone();
            req.opaque = self.next_opaque;
            self.next_opaque = self.next_opaque.wrapping_add(1).max(1);
            req.encode()
        } else {
            req.encode()
        };
        let written = self
            .transport
            .write_all(&bytes)
            .and_then(|()| self.transport.flush());
        self.track(written.map_err(ClientError::from))
    }

    /// Read one response.
    pub fn receive(&mut self) -> Result<Response, ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        let frame = read_frame(&mut self.transport);
        match self.track(frame)? {
            Frame::Response(res) => Ok(res),
            Frame::Request(req) => {
                self.healthy = false;
                Err(ClientError::Frame(format!(
                    "expected a response, server sent {} request",
                    req.opcode
                )))
            }
        }
    }

    /// Send `req` and wait for its response. A non-success status is an error.
    pub fn round_trip(&mut self, req: &Request) -> Result<Response, ClientError> {
        self.send(req)?;
        let res = self.receive()?;
        if !res.status.is_success() {
            return Err(ClientError::Status {
                opcode: res.opcode,
                status: res.status,
            });
        }
        Ok(res)
    }

    pub fn noop(&mut self) -> Result<(), ClientError> {
        self.round_trip(&Request::new(Opcode::NOOP)).map(|_| ())
    }

    /// SASL mechanisms offered by the server.
    pub fn list_auth_mechanisms(&mut self) -> Result<Vec<String>, ClientError> {
        let res = self.round_trip(&Request::new(Opcode::SASL_LIST_MECHS))?;
        Ok(String::from_utf8_lossy(&res.body)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    /// Authenticate with SASL `PLAIN`.
    pub fn auth(&mut self, user: &str, pass: &str) -> Result<Response, ClientError> {
        let mechanisms = self.list_auth_mechanisms()?;
        if !mechanisms.iter().any(|m| m == "PLAIN") {
            return Err(ClientError::UnsupportedMechanism(mechanisms.join(" ")));
        }

        let req = Request::new(Opcode::SASL_AUTH)
            .with_key("PLAIN")
            .with_body(format!("\0{user}\0{pass}"));
        self.round_trip(&req).map_err(|err| match err {
            ClientError::Status { status, .. } => ClientError::Auth {
                user: user.to_string(),
                status,
            },
            other => other,
        })
    }

    fn track<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.healthy = false;
            }
        }
        result
    }
}

impl Connection for MemcachedClient {
    type Feed = TapFeed;

    fn is_healthy(&self) -> bool {
        self.healthy && !self.closed && self.transport.is_alive()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.shutdown();
        }
    }

    fn start_tap_feed(mut self, args: &TapArguments) -> Result<TapFeed, ClientError> {
        let started = args
            .to_request()
            .and_then(|req| self.send(&req))
            .and_then(|()| Ok(self.transport.set_read_timeout(None)?));
        if let Err(err) = started {
            self.close();
            return Err(err);
        }
        tracing::debug!(client = %args.client_name, "starting tap feed");
        TapFeed::spawn(self.transport)
    }
}

/// Default connection factory: open a transport, then authenticate unless the
/// credentials name the default (anonymous) user.
#[derive(Clone, Debug, Default)]
pub struct TcpConnectionFactory {
    options: TransportOptions,
}

impl TcpConnectionFactory {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }
}

impl ConnectionFactory<MemcachedClient> for TcpConnectionFactory {
    fn connect(&self, host: &str, auth: &dyn AuthHandler) -> Result<MemcachedClient, ClientError> {
        let mut conn = MemcachedClient::connect(host, &self.options)?;

        let (name, pass) = auth.credentials();
        if name != DEFAULT_USER {
            if let Err(err) = conn.auth(&name, &pass) {
                tracing::debug!(host = %host, user = %name, error = %err, "authentication failed");
                conn.close();
                return Err(err);
            }
        }
        Ok(conn)
    }
}
