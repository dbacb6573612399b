pub mod ber;
pub mod bind;
pub mod cache;
pub mod config;
pub mod directory;
pub mod framing;
pub mod identity;
pub mod metrics;
pub mod mfa;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;
pub mod transform;

#[cfg(test)]
mod testutil;

pub use config::{Config, LiveConfig};
pub use metrics::{run_metrics_server, Metrics};
pub use server::ProxyServer;
pub use session::ProxySession;
