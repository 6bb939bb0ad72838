//! Connection pool tests against a mock memcached server.
//!
//! The mock speaks enough of the binary protocol for the pool's default
//! connection type: SASL `PLAIN`, NOOP, and a TAP_CONNECT that streams a few
//! mutations and then holds the socket open until the client hangs up.
//!
//! The test stack: `ConnectionPool` → `TcpConnectionFactory` → TCP → `MockMemcachedServer`

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memcached_pool::client::protocol::{Frame, Opcode, Request, Response, Status, read_frame};
use memcached_pool::{
    Anonymous, AuthHandler, BasicAuth, ClientError, Connection, ConnectionPool, MaybePool,
    PoolConfig, PoolError, TapArguments, TapEventKind, TcpConnectionFactory, TransportOptions,
};

const PASSWORD: &str = "s3cret";
const TAP_EVENTS: usize = 3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── MockMemcachedServer ─────────────────────────────────────────────

struct MockMemcachedServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
}

impl MockMemcachedServer {
    /// Serve SASL, NOOP and TAP on every accepted connection.
    fn start() -> Self {
        Self::spawn(|stream| Self::handle_connection(stream))
    }

    /// Accept, then hang up immediately.
    fn start_hang_up() -> Self {
        Self::spawn(|stream| drop(stream))
    }

    fn spawn<F>(handler: F) -> Self
    where
        F: Fn(TcpStream) + Send + Sync + Copy + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));

        let (acc, disc) = (accepted.clone(), disconnected.clone());
        std::thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                acc.fetch_add(1, Ordering::SeqCst);
                let disc = disc.clone();
                std::thread::spawn(move || {
                    handler(stream);
                    disc.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            disconnected,
        }
    }

    fn host(&self) -> String {
        self.addr.to_string()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Poll until `n` connections have ended server-side.
    fn wait_for_disconnects(&self, n: usize) -> bool {
        for _ in 0..100 {
            if self.disconnected.load(Ordering::SeqCst) >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn handle_connection(mut stream: TcpStream) {
        while let Ok(Frame::Request(req)) = read_frame(&mut stream) {
            let mut res = match req.opcode {
                Opcode::SASL_LIST_MECHS => {
                    Response::new(req.opcode, Status::SUCCESS).with_body("PLAIN")
                }
                Opcode::SASL_AUTH => {
                    let expected = format!("\0app\0{PASSWORD}");
                    if req.body == expected.as_bytes() {
                        Response::new(req.opcode, Status::SUCCESS)
                    } else {
                        Response::new(req.opcode, Status::AUTH_ERROR)
                    }
                }
                Opcode::TAP_CONNECT => {
                    Self::stream_tap(&mut stream);
                    return;
                }
                _ => Response::new(req.opcode, Status::SUCCESS),
            };
            res.opaque = req.opaque;
            if stream.write_all(&res.encode()).is_err() {
                return;
            }
        }
    }

    fn stream_tap(stream: &mut TcpStream) {
        for i in 0..TAP_EVENTS {
            let event = Request::new(Opcode::TAP_MUTATION)
                .with_extras(vec![0u8; 16])
                .with_key(format!("key-{i}"))
                .with_body(format!("value-{i}"));
            if stream.write_all(&event.encode()).is_err() {
                return;
            }
        }
        // Hold the stream open until the client hangs up.
        let mut buf = [0u8; 64];
        while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn make_pool(
    server: &MockMemcachedServer,
    auth: Arc<dyn AuthHandler>,
    pool_size: usize,
    pool_overflow: usize,
) -> ConnectionPool {
    let factory = TcpConnectionFactory::new(TransportOptions {
        connect_timeout: Duration::from_secs(2),
        recv_timeout: Duration::from_secs(2),
        tls: None,
    });
    let config = PoolConfig {
        pool_size,
        pool_overflow,
        acquire_timeout: Duration::from_secs(5),
    };
    ConnectionPool::with_factory(server.host(), auth, config, Arc::new(factory))
}

fn app_auth() -> Arc<dyn AuthHandler> {
    Arc::new(BasicAuth::new("app", PASSWORD))
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn authenticated_connection_is_reused() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, app_auth(), 2, 0);

    let mut conn = pool.get().await.expect("connect and authenticate");
    conn.noop().expect("noop");
    pool.return_connection(conn);

    let mut again = pool.get().await.expect("reuse");
    again.noop().expect("noop on reused connection");
    pool.return_connection(again);

    assert_eq!(server.accepted(), 1);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn auth_failure_surfaces_and_releases_slot() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, Arc::new(BasicAuth::new("app", "wrong")), 1, 0);

    for _ in 0..2 {
        let err = pool
            .get_with_timeout(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                PoolError::Client(ClientError::Auth { status: Status::AUTH_ERROR, .. })
            ),
            "expected auth error, got {err:?}"
        );
        assert_eq!(pool.stats().live, 0);
    }

    assert!(server.wait_for_disconnects(2), "failed connections must be closed");
}

#[tokio::test]
async fn anonymous_pool_skips_sasl() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, Arc::new(Anonymous), 1, 0);

    let mut conn = pool.get().await.unwrap();
    conn.noop().unwrap();
    pool.return_connection(conn);
}

#[tokio::test]
async fn capacity_bounds_live_connections() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, app_auth(), 1, 1);

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    let err = pool
        .get_with_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)));
    assert_eq!(server.accepted(), 2);

    pool.return_connection(a);
    pool.return_connection(b);
    assert_eq!(pool.stats().idle, 1, "overflow connection is not kept");
    assert!(server.wait_for_disconnects(1));
}

#[tokio::test]
async fn dead_connection_is_retired_on_return() {
    init_tracing();
    let server = MockMemcachedServer::start_hang_up();
    let pool = make_pool(&server, Arc::new(Anonymous), 1, 0);

    let conn = pool.get().await.unwrap();
    assert!(server.wait_for_disconnects(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!conn.is_healthy(), "peer hang-up must be detected");

    pool.return_connection(conn);
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn close_shuts_down_idle_connections() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, app_auth(), 2, 0);

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    pool.return_connection(a);
    pool.return_connection(b);

    pool.close();
    assert!(server.wait_for_disconnects(2));
    assert!(matches!(pool.get().await, Err(PoolError::Closed)));
}

#[tokio::test]
async fn tap_feed_streams_events_outside_pool_accounting() {
    init_tracing();
    let server = MockMemcachedServer::start();
    let pool = make_pool(&server, app_auth(), 1, 0);

    let args = TapArguments {
        dump: true,
        client_name: "indexer".to_string(),
        ..TapArguments::default()
    };
    let mut feed = pool.start_tap_feed(&args).await.expect("start tap feed");
    assert_eq!(pool.stats().live, 0);

    // The single slot is free again while the feed runs.
    let conn = pool
        .get_with_timeout(Duration::from_millis(500))
        .await
        .expect("slot released by tap feed");
    assert_eq!(server.accepted(), 2);

    for i in 0..TAP_EVENTS {
        let event = tokio::time::timeout(Duration::from_secs(2), feed.next())
            .await
            .expect("event before timeout")
            .expect("feed still open")
            .expect("event, not error");
        assert_eq!(event.kind, TapEventKind::Mutation);
        assert_eq!(event.key, format!("key-{i}").into_bytes());
        assert_eq!(event.value, format!("value-{i}").into_bytes());
    }

    feed.close();
    assert!(server.wait_for_disconnects(1), "closing the feed closes its connection");
    pool.return_connection(conn);
}

#[tokio::test]
async fn absent_pool_reports_no_pool() {
    let pool: Option<&ConnectionPool> = None;
    assert!(matches!(pool.get().await, Err(PoolError::NoPool)));
    assert!(matches!(
        pool.start_tap_feed(&TapArguments::default()).await,
        Err(PoolError::NoPool)
    ));
    pool.return_connection(None);
    pool.close();
}
