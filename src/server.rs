// Listener setup and the accept loop. Each accepted connection is matched to
// a client policy by peer address, optionally TLS-unwrapped, dialed through
// to the backend directory and handed to its own ProxySession task.

use crate::cache::SharedCaches;
use crate::config::LiveConfig;
use crate::metrics::Metrics;
use crate::mfa::SecondFactorVerifier;
use crate::session::ProxySession;
use crate::tls::{self, StreamUpgrader};
use anyhow::{anyhow, bail, Context, Result};
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// Client-side stream: plain TCP or TLS-wrapped, so ldap:// and ldaps://
/// listeners share the whole session code path.
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(ServerTlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Backend-side stream, mirroring ClientStream for the upstream connection.
pub enum BackendStream {
    Tcp(TcpStream),
    Tls(ClientTlsStream<TcpStream>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Split ldap://host:port or ldaps://host:port into a bind address and
/// whether the listener speaks TLS. A bare `:port` binds all interfaces.
pub fn parse_listen_url(url: &str) -> Result<(SocketAddr, bool)> {
    let (rest, listener_tls) = match url.strip_prefix("ldap://") {
        Some(rest) => (rest, false),
        None => match url.strip_prefix("ldaps://") {
            Some(rest) => (rest, true),
            None => bail!("invalid listen URL scheme, expected ldap:// or ldaps://"),
        },
    };
    let rest = rest.trim_start_matches('/');
    let addr = if let Some(port) = rest.strip_prefix(':') {
        // Just a port: bind to all interfaces
        let port: u16 = port.parse().context("invalid port number")?;
        SocketAddr::from(([0, 0, 0, 0], port))
    } else {
        rest.parse()
            .with_context(|| format!("failed to parse listen address {rest:?}"))?
    };
    Ok((addr, listener_tls))
}

/// Split a backend URI into host, port and TLS flag. A missing port falls
/// back to the scheme default.
pub fn parse_ldap_uri_to_host_port(uri: &str) -> Result<(String, u16, bool)> {
    let (rest, use_tls) = match uri.strip_prefix("ldap://") {
        Some(rest) => (rest, false),
        None => match uri.strip_prefix("ldaps://") {
            Some(rest) => (rest, true),
            None => bail!("invalid backend URI scheme: {uri}"),
        },
    };
    let rest = rest.trim_start_matches('/').trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .with_context(|| format!("invalid port in backend URI {uri}"))?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), if use_tls { 636 } else { 389 }),
    };
    if host.is_empty() {
        bail!("no host in backend URI: {uri}");
    }
    Ok((host, port, use_tls))
}

/// Dials the upstream directory. The TLS client configuration is resolved
/// once at startup; every session gets its own fresh connection.
pub struct BackendConnector {
    host: String,
    port: u16,
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl BackendConnector {
    pub fn new(url: &str, skip_verify: bool, ca_file: Option<&str>) -> Result<Self> {
        let (host, port, use_tls) = parse_ldap_uri_to_host_port(url)?;
        let tls_config = if use_tls {
            Some(tls::backend_client_config(skip_verify, ca_file)?)
        } else {
            None
        };
        Ok(BackendConnector {
            host,
            port,
            tls_config,
        })
    }

    pub async fn connect(&self) -> Result<BackendStream> {
        let addr = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to backend {addr}"))?;
        match &self.tls_config {
            None => Ok(BackendStream::Tcp(tcp)),
            Some(config) => {
                let connector = TlsConnector::from(Arc::clone(config));
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|_| anyhow!("invalid backend hostname for TLS SNI: {}", self.host))?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .with_context(|| format!("TLS handshake with backend {addr} failed"))?;
                Ok(BackendStream::Tls(stream))
            }
        }
    }
}

/// The accept loop: one spawned ProxySession per client connection.
pub struct ProxyServer {
    listen_url: String,
    upgrader: Arc<StreamUpgrader>,
    connector: Arc<BackendConnector>,
    live: LiveConfig,
    caches: Arc<SharedCaches>,
    verifier: Arc<dyn SecondFactorVerifier>,
    metrics: Arc<Metrics>,
}

impl ProxyServer {
    pub fn new(
        listen_url: String,
        upgrader: Arc<StreamUpgrader>,
        connector: Arc<BackendConnector>,
        live: LiveConfig,
        caches: Arc<SharedCaches>,
        verifier: Arc<dyn SecondFactorVerifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ProxyServer {
            listen_url,
            upgrader,
            connector,
            live,
            caches,
            verifier,
            metrics,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let (addr, _) = parse_listen_url(&self.listen_url)?;

        info!("Starting LDAP second-factor proxy on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;

        info!("Listening on {}", addr);
        info!(
            "Backend directory: {}",
            self.live.snapshot().config.server.ldap_server
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    self.metrics.inc_connections();
                    let policy = match self.live.snapshot().policy_for_peer(peer_addr.ip()) {
                        Some(policy) => policy,
                        None => {
                            warn!("No client policy matches {}, dropping the connection", peer_addr);
                            continue;
                        }
                    };
                    let upgrader = Arc::clone(&self.upgrader);
                    let connector = Arc::clone(&self.connector);
                    let caches = Arc::clone(&self.caches);
                    let verifier = Arc::clone(&self.verifier);
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(async move {
                        let client = match upgrader.upgrade(stream).await {
                            Ok(client) => client,
                            Err(e) => {
                                error!("TLS handshake failed for {}: {e:#}", peer_addr);
                                return;
                            }
                        };
                        let backend = match connector.connect().await {
                            Ok(backend) => backend,
                            Err(e) => {
                                error!("Backend unavailable for {}: {e:#}", peer_addr);
                                return;
                            }
                        };
                        let session =
                            ProxySession::new(peer_addr, policy, caches, verifier, metrics);
                        if let Err(e) = session.run(client, backend).await {
                            error!("Error handling client {}: {e:#}", peer_addr);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_url_ldap() {
        let (addr, tls) = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert!(!tls);
    }

    #[test]
    fn test_parse_listen_url_ldaps() {
        let (addr, tls) = parse_listen_url("ldaps://0.0.0.0:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert!(tls);
    }

    #[test]
    fn test_parse_listen_url_port_only() {
        let (addr, _) = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_listen_url_with_slashes() {
        let (addr, _) = parse_listen_url("ldap:///127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
    }

    #[test]
    fn test_parse_listen_url_invalid_scheme() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("invalid://127.0.0.1:1389").is_err());
    }

    #[test]
    fn test_parse_listen_url_invalid_port() {
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://:abc").is_err());
    }

    #[test]
    fn test_parse_listen_url_invalid_address() {
        assert!(parse_listen_url("ldap://invalid:address").is_err());
    }

    #[test]
    fn test_parse_backend_uri_scheme_defaults() {
        let (host, port, tls) = parse_ldap_uri_to_host_port("ldap://dc1.corp.example").unwrap();
        assert_eq!(host, "dc1.corp.example");
        assert_eq!(port, 389);
        assert!(!tls);

        let (host, port, tls) = parse_ldap_uri_to_host_port("ldaps://dc1.corp.example/").unwrap();
        assert_eq!(host, "dc1.corp.example");
        assert_eq!(port, 636);
        assert!(tls);
    }

    #[test]
    fn test_parse_backend_uri_explicit_port() {
        let (host, port, tls) = parse_ldap_uri_to_host_port("ldaps://10.0.0.5:10636").unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 10636);
        assert!(tls);
    }

    #[test]
    fn test_parse_backend_uri_rejects_other_schemes() {
        assert!(parse_ldap_uri_to_host_port("https://dc1.corp.example").is_err());
        assert!(parse_ldap_uri_to_host_port("dc1.corp.example:389").is_err());
        assert!(parse_ldap_uri_to_host_port("ldap://:389").is_err());
    }
}
