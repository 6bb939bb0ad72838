//! TCP/TLS transport underneath a memcached connection.
//!
//! A [`Transport`] is a plain TCP stream or a TLS-wrapped one; it implements
//! [`Read`] and [`Write`] so packet framing is identical on both. TLS is
//! handled by `rustls`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::error::ClientError;

/// Options used when opening a new transport.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Timeout for establishing the TCP connection (default: 5s). Zero
    /// disables it.
    pub connect_timeout: Duration,
    /// Read timeout applied to request/response traffic (default: 30s). Zero
    /// disables it.
    pub recv_timeout: Duration,
    /// TLS configuration. `None` means plain TCP.
    pub tls: Option<TlsConfig>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

// ── TlsConfig ────────────────────────────────────────────────────────

/// Trust settings for connections to TLS-enabled memcached endpoints.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// Trust the bundled Mozilla roots.
    pub fn with_system_roots() -> Result<Self, ClientError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Trust only the given DER-encoded CA certificates, such as a private
    /// cluster CA.
    pub fn with_ca_certificates<I>(certs: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        let mut roots = rustls::RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }
        Self::with_roots(roots)
    }

    fn with_roots(roots: rustls::RootCertStore) -> Result<Self, ClientError> {
        if roots.is_empty() {
            return Err(ClientError::Tls(rustls::Error::General(
                "no trusted root certificates".to_string(),
            )));
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            client_config: Arc::new(config),
        })
    }
}

// ── Transport ────────────────────────────────────────────────────────

enum Stream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

/// Byte stream to a memcached server.
pub struct Transport {
    stream: Stream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("tls", &self.is_tls())
            .finish()
    }
}

/// std rejects zero socket timeouts; zero means "no timeout" here.
fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Strip the port (and IPv6 brackets) from a `host:port` address.
pub(crate) fn server_name(host: &str) -> &str {
    let name = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    name.trim_start_matches('[').trim_end_matches(']')
}

impl Transport {
    /// Open a transport to `host` (`name:port`).
    pub fn connect(host: &str, options: &TransportOptions) -> Result<Self, ClientError> {
        let addr = host
            .to_socket_addrs()
            .map_err(|source| ClientError::Resolve {
                host: host.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ClientError::NoAddress(host.to_string()))?;

        let connected = match non_zero(options.connect_timeout) {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        let stream = connected.map_err(|source| ClientError::Connect {
            host: host.to_string(),
            source,
        })?;
        stream.set_read_timeout(non_zero(options.recv_timeout))?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            host = %host,
            tls = options.tls.is_some(),
            "established tcp connection"
        );

        match &options.tls {
            Some(tls) => {
                let name = server_name(host);
                let server_name = rustls::pki_types::ServerName::try_from(name)
                    .map_err(|_| ClientError::ServerName(name.to_string()))?
                    .to_owned();
                let session =
                    rustls::ClientConnection::new(Arc::clone(&tls.client_config), server_name)?;
                Ok(Self::tls(rustls::StreamOwned::new(session, stream)))
            }
            None => Ok(Self::plain(stream)),
        }
    }

    pub fn plain(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Plain(stream),
        }
    }

    pub fn tls(stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>) -> Self {
        Self {
            stream: Stream::Tls(Box::new(stream)),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// The underlying TCP stream, regardless of the TLS layer.
    fn tcp_stream(&self) -> &TcpStream {
        match &self.stream {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp_stream().set_read_timeout(timeout)
    }

    /// Non-blocking check that the peer has not closed the socket.
    pub fn is_alive(&self) -> bool {
        let stream = self.tcp_stream();
        if stream.set_nonblocking(true).is_err() {
            return false;
        }

        let mut peek_buf = [0u8; 1];
        let alive = match stream.peek(&mut peek_buf) {
            Ok(0) => false, // EOF
            Ok(_) => true,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
        };

        let _ = stream.set_nonblocking(false);
        alive
    }

    /// A second handle on the socket that can shut it down from another thread.
    pub fn shutdown_handle(&self) -> io::Result<TcpStream> {
        self.tcp_stream().try_clone()
    }

    pub fn shutdown(&self) {
        let _ = self.tcp_stream().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::protocol::{Opcode, Request};
    use std::net::TcpListener;

    fn start_tcp_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        (listener, addr)
    }

    fn start_echo_server() -> std::net::SocketAddr {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        std::thread::sleep(Duration::from_millis(10));
        addr
    }

    fn options(recv_timeout: Duration) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(2),
            recv_timeout,
            tls: None,
        }
    }

    #[test]
    fn server_name_strips_port() {
        assert_eq!(server_name("cache.local:11210"), "cache.local");
        assert_eq!(server_name("cache.local"), "cache.local");
        assert_eq!(server_name("[::1]:11210"), "::1");
    }

    #[test]
    fn plain_roundtrip() {
        let addr = start_echo_server();
        let mut transport =
            Transport::connect(&addr.to_string(), &options(Duration::from_secs(2))).unwrap();

        transport.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        transport.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(!transport.is_tls());
    }

    #[test]
    fn connect_refused() {
        // Port 1 is unlikely to have a listener.
        let result = Transport::connect("127.0.0.1:1", &options(Duration::from_secs(1)));
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }

    #[test]
    fn unresolvable_host() {
        let result = Transport::connect("no port here", &options(Duration::from_secs(1)));
        assert!(matches!(result, Err(ClientError::Resolve { .. })));
    }

    #[test]
    fn recv_timeout_is_applied() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(5));
        });

        let mut transport =
            Transport::connect(&addr.to_string(), &options(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 1];
        assert!(transport.read(&mut buf).is_err(), "read should time out");
    }

    #[test]
    fn zero_timeouts_mean_no_timeout() {
        let addr = start_echo_server();
        let opts = TransportOptions {
            connect_timeout: Duration::ZERO,
            recv_timeout: Duration::ZERO,
            tls: None,
        };
        let mut transport = Transport::connect(&addr.to_string(), &opts).unwrap();
        assert_eq!(transport.tcp_stream().read_timeout().unwrap(), None);

        transport.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        transport.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn alive_while_peer_is_open() {
        let addr = start_echo_server();
        let transport =
            Transport::connect(&addr.to_string(), &options(Duration::from_secs(2))).unwrap();
        assert!(transport.is_alive());
    }

    #[test]
    fn not_alive_after_peer_closes() {
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let transport =
            Transport::connect(&addr.to_string(), &options(Duration::from_secs(2))).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!transport.is_alive());
    }

    #[test]
    fn shutdown_breaks_writes() {
        let addr = start_echo_server();
        let mut transport =
            Transport::connect(&addr.to_string(), &options(Duration::from_millis(200))).unwrap();

        transport.shutdown();
        assert!(transport.write_all(b"data").is_err());
        assert!(!transport.is_alive());
    }

    #[test]
    fn tls_config_with_system_roots_succeeds() {
        assert!(TlsConfig::with_system_roots().is_ok());
    }

    fn self_signed_server() -> (rustls::ServerConfig, CertificateDer<'static>) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der =
            rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();
        (config, cert_der)
    }

    /// TLS echo server on 127.0.0.1.
    fn start_tls_echo_server(config: rustls::ServerConfig) -> std::net::SocketAddr {
        let config = Arc::new(config);
        let (listener, addr) = start_tcp_listener();
        std::thread::spawn(move || {
            while let Ok((tcp, _)) = listener.accept() {
                let config = config.clone();
                std::thread::spawn(move || {
                    let Ok(session) = rustls::ServerConnection::new(config) else {
                        return;
                    };
                    let mut tls = rustls::StreamOwned::new(session, tcp);
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = tls.read(&mut buf) {
                        if n == 0 || tls.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn tls_roundtrip_with_private_ca() {
        let (server_config, cert) = self_signed_server();
        let addr = start_tls_echo_server(server_config);

        let opts = TransportOptions {
            tls: Some(TlsConfig::with_ca_certificates([cert]).unwrap()),
            ..options(Duration::from_secs(2))
        };
        let mut transport = Transport::connect(&addr.to_string(), &opts).unwrap();
        assert!(transport.is_tls());

        let packet = Request::new(Opcode::NOOP).encode();
        transport.write_all(&packet).unwrap();
        transport.flush().unwrap();
        let mut buf = vec![0u8; packet.len()];
        transport.read_exact(&mut buf).unwrap();
        assert_eq!(buf, packet);
    }

    #[test]
    fn tls_rejects_untrusted_certificate() {
        let (server_config, _) = self_signed_server();
        let addr = start_tls_echo_server(server_config);

        let opts = TransportOptions {
            tls: Some(TlsConfig::with_system_roots().unwrap()),
            ..options(Duration::from_secs(2))
        };
        let mut transport = Transport::connect(&addr.to_string(), &opts).unwrap();

        // The handshake runs on first I/O.
        let _ = transport.write_all(b"x").and_then(|()| transport.flush());
        let mut buf = [0u8; 1];
        assert!(transport.read_exact(&mut buf).is_err());
    }

    #[test]
    fn empty_ca_list_is_rejected() {
        let result = TlsConfig::with_ca_certificates(Vec::new());
        assert!(matches!(result, Err(ClientError::Tls(_))));
    }
}
