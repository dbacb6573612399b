use anyhow::Result;
use clap::Parser;
use ldap_mfa_proxy::cache::SharedCaches;
use ldap_mfa_proxy::mfa::ApiVerifier;
use ldap_mfa_proxy::server::{self, BackendConnector};
use ldap_mfa_proxy::tls::StreamUpgrader;
use ldap_mfa_proxy::{run_metrics_server, LiveConfig, Metrics, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-mfa-proxy")]
#[command(about = "Intercepting LDAP proxy that adds second-factor verification to simple binds")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Signal handler for graceful shutdown
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install Ctrl+C handler: {}", e))
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to install SIGTERM handler: {}", e)),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result?,
        result = terminate => result?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_mfa_proxy={},info", log_level))
        .init();

    info!("Starting LDAP MFA Proxy");

    let live = LiveConfig::load(&args.config)?;
    let startup = live.snapshot();

    let listen_url = args
        .listen
        .clone()
        .unwrap_or_else(|| startup.config.server.listen.clone());
    let (_, listener_tls) = server::parse_listen_url(&listen_url)?;

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Backend directory: {}", startup.config.server.ldap_server);
    info!("  Client policies: {}", startup.policies.len());

    let upgrader = Arc::new(StreamUpgrader::from_listener(
        listener_tls,
        startup.config.server.tls_cert_file.as_deref(),
        startup.config.server.tls_key_file.as_deref(),
    )?);
    if listener_tls {
        info!("TLS enabled for listener (LDAPS)");
    }
    let connector = Arc::new(BackendConnector::new(
        &startup.config.server.ldap_server,
        startup.config.server.backend_tls_skip_verify,
        startup.config.server.backend_tls_ca_file.as_deref(),
    )?);
    let verifier = Arc::new(ApiVerifier::new(&startup.config.api)?);
    let caches = Arc::new(SharedCaches::new());
    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = startup.config.server.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let live_for_metrics = live.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, live_for_metrics).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    #[cfg(unix)]
    ldap_mfa_proxy::config::spawn_sighup_reload(live.clone());

    let proxy = ProxyServer::new(
        listen_url,
        upgrader,
        connector,
        live,
        caches,
        verifier,
        metrics,
    );

    tokio::select! {
        result = proxy.run() => result,
        result = shutdown_signal() => {
            result?;
            info!("Received shutdown signal, shutting down");
            Ok(())
        }
    }
}
