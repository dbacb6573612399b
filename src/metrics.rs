//! Prometheus-format counters plus the small HTTP endpoint that serves them.

use crate::config::LiveConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Process-wide counters (thread-safe, lock-free). One instance is built in
/// main and shared by every session.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Client connections accepted.
    pub connections_total: AtomicU64,
    /// Bind requests with an extractable username that entered interception.
    pub binds_intercepted: AtomicU64,
    /// Bind responses replaced by a synthesized rejection.
    pub binds_rejected: AtomicU64,
    /// Second-factor outcomes.
    pub second_factor_granted: AtomicU64,
    pub second_factor_denied: AtomicU64,
    pub second_factor_bypassed: AtomicU64,
    pub second_factor_cached: AtomicU64,
    /// Unframeable or undecodable packets forwarded untouched.
    pub framing_passthrough: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_binds_intercepted(&self) {
        self.binds_intercepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_binds_rejected(&self) {
        self.binds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_granted(&self) {
        self.second_factor_granted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_denied(&self) {
        self.second_factor_denied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_bypassed(&self) {
        self.second_factor_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_second_factor_cached(&self) {
        self.second_factor_cached.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_framing_passthrough(&self) {
        self.framing_passthrough.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in the Prometheus exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let c = self.connections_total.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_mfa_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_mfa_connections_total counter\n");
        out.push_str(&format!("ldap_mfa_connections_total {}\n", c));

        let b = self.binds_intercepted.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_mfa_binds_intercepted_total Bind requests intercepted with an extractable username.\n");
        out.push_str("# TYPE ldap_mfa_binds_intercepted_total counter\n");
        out.push_str(&format!("ldap_mfa_binds_intercepted_total {}\n", b));

        let r = self.binds_rejected.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_mfa_binds_rejected_total Bind responses replaced by a synthesized rejection.\n");
        out.push_str("# TYPE ldap_mfa_binds_rejected_total counter\n");
        out.push_str(&format!("ldap_mfa_binds_rejected_total {}\n", r));

        out.push_str("# HELP ldap_mfa_second_factor_total Second-factor decisions by outcome.\n");
        out.push_str("# TYPE ldap_mfa_second_factor_total counter\n");
        for (outcome, val) in [
            ("granted", self.second_factor_granted.load(Ordering::Relaxed)),
            ("denied", self.second_factor_denied.load(Ordering::Relaxed)),
            ("bypassed", self.second_factor_bypassed.load(Ordering::Relaxed)),
            ("cached", self.second_factor_cached.load(Ordering::Relaxed)),
        ] {
            out.push_str(&format!(
                "ldap_mfa_second_factor_total{{outcome=\"{}\"}} {}\n",
                outcome, val
            ));
        }

        let p = self.framing_passthrough.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_mfa_framing_passthrough_total Packets forwarded raw because they could not be framed or decoded.\n");
        out.push_str("# TYPE ldap_mfa_framing_passthrough_total counter\n");
        out.push_str(&format!("ldap_mfa_framing_passthrough_total {}\n", p));

        out
    }
}

/// Body of GET /ready.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    backend: String,
}

/// Path out of the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Serve GET /metrics, GET /health and GET /ready on `addr`.
/// - /health (liveness): 200 while the process runs.
/// - /ready (readiness): 200 once the proxy serves; the body names the
///   currently configured backend so a reload is visible from outside.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, live: LiveConfig) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let live = live.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");

            let (status, body, content_type) = match path {
                "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
                "/ready" => {
                    let backend = live.snapshot().config.server.ldap_server.clone();
                    let body_json = serde_json::to_string(&ReadyBody {
                        ready: true,
                        backend,
                    })
                    .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
                    ("200 OK", body_json, "application/json")
                }
                "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
                _ => (
                    "404 Not Found",
                    "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
                    "text/plain; charset=utf-8",
                ),
            };
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
