// Configuration: the YAML file layout, per-client policy compilation, and
// the live handle that a SIGHUP reload swaps under running sessions.

use crate::identity::IdentityFormat;
use crate::transform::TransformRule;
use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen URL: ldap://host:port or ldaps://host:port.
    pub listen: String,
    /// The real directory server behind the proxy, same URL scheme.
    pub ldap_server: String,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    /// Accept any backend certificate. Test setups and internal networks only.
    #[serde(default)]
    pub backend_tls_skip_verify: bool,
    /// Extra PEM CA bundle trusted for ldaps:// backends.
    pub backend_tls_ca_file: Option<String>,
    /// HTTP listen address for metrics and health (e.g. "0.0.0.0:9090").
    /// Endpoints: GET /metrics (Prometheus), GET /health, GET /ready.
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Access API endpoints, tried in order until one answers.
    pub urls: Vec<String>,
    pub key: String,
    pub secret: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// When no endpoint answers: true lets the bind through, false denies it.
    #[serde(default)]
    pub bypass_second_factor_when_unreachable: bool,
}

fn default_api_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// How much of the directory profile the access API gets to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    #[default]
    None,
    Full,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRuleConfig {
    #[serde(rename = "match")]
    pub pattern: String,
    pub replace: String,
    /// Replacements per rule; absent means all occurrences.
    pub count: Option<usize>,
}

/// One client block as written in the file. `compile` turns it into the
/// checked form sessions actually use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    /// Peer addresses this policy applies to; empty list makes it the
    /// catch-all fallback.
    #[serde(default)]
    pub source_ips: Vec<String>,
    pub base_dn: Option<String>,
    #[serde(default)]
    pub service_accounts: Vec<String>,
    /// OU substrings; a bind DN containing one passes through untouched.
    #[serde(default)]
    pub service_account_ous: Vec<String>,
    #[serde(default)]
    pub access_groups: Vec<String>,
    #[serde(default)]
    pub second_factor_groups: Vec<String>,
    #[serde(default)]
    pub second_factor_bypass_groups: Vec<String>,
    #[serde(default = "default_true")]
    pub nested_groups: bool,
    #[serde(default = "default_true")]
    pub load_profile: bool,
    pub identity_format: Option<IdentityFormat>,
    #[serde(default)]
    pub transform_before_first_factor: Vec<TransformRuleConfig>,
    #[serde(default)]
    pub transform_before_second_factor: Vec<TransformRuleConfig>,
    #[serde(default)]
    pub privacy_mode: PrivacyMode,
    #[serde(default)]
    pub privacy_fields: Vec<String>,
    /// Seconds a granted second factor stays valid; 0 disables the cache.
    #[serde(default)]
    pub auth_cache_ttl_secs: u64,
    #[serde(default)]
    pub bind_delay_min_secs: u64,
    #[serde(default)]
    pub bind_delay_max_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            name: "default".to_string(),
            source_ips: Vec::new(),
            base_dn: None,
            service_accounts: Vec::new(),
            service_account_ous: Vec::new(),
            access_groups: Vec::new(),
            second_factor_groups: Vec::new(),
            second_factor_bypass_groups: Vec::new(),
            nested_groups: true,
            load_profile: true,
            identity_format: None,
            transform_before_first_factor: Vec::new(),
            transform_before_second_factor: Vec::new(),
            privacy_mode: PrivacyMode::None,
            privacy_fields: Vec::new(),
            auth_cache_ttl_secs: 0,
            bind_delay_min_secs: 0,
            bind_delay_max_secs: 0,
        }
    }
}

impl ClientConfig {
    pub fn compile(&self) -> Result<ClientPolicy> {
        let source_ips = self
            .source_ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("client {}: bad source IP {s:?}", self.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let compile_rules = |rules: &[TransformRuleConfig], stage: &str| {
            rules
                .iter()
                .map(|r| {
                    TransformRule::new(&r.pattern, &r.replace, r.count).with_context(|| {
                        format!("client {}: bad {stage} rule {:?}", self.name, r.pattern)
                    })
                })
                .collect::<Result<Vec<_>>>()
        };
        if self.bind_delay_min_secs > self.bind_delay_max_secs {
            bail!(
                "client {}: bind_delay_min_secs exceeds bind_delay_max_secs",
                self.name
            );
        }
        Ok(ClientPolicy {
            name: self.name.clone(),
            source_ips,
            base_dn: self
                .base_dn
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            service_accounts: self.service_accounts.clone(),
            service_account_ous: self.service_account_ous.clone(),
            access_groups: self.access_groups.clone(),
            second_factor_groups: self.second_factor_groups.clone(),
            second_factor_bypass_groups: self.second_factor_bypass_groups.clone(),
            nested_groups: self.nested_groups,
            load_profile: self.load_profile,
            identity_format: self.identity_format,
            transform_before_first_factor: compile_rules(
                &self.transform_before_first_factor,
                "transform_before_first_factor",
            )?,
            transform_before_second_factor: compile_rules(
                &self.transform_before_second_factor,
                "transform_before_second_factor",
            )?,
            privacy_mode: self.privacy_mode,
            privacy_fields: self.privacy_fields.clone(),
            auth_cache_ttl: Duration::from_secs(self.auth_cache_ttl_secs),
            bind_delay_min: Duration::from_secs(self.bind_delay_min_secs),
            bind_delay_max: Duration::from_secs(self.bind_delay_max_secs),
        })
    }
}

/// A client block with its patterns compiled and durations resolved. Sessions
/// hold an Arc of this for their whole lifetime; a reload never changes a
/// policy under a running session.
#[derive(Debug)]
pub struct ClientPolicy {
    pub name: String,
    pub source_ips: Vec<IpAddr>,
    pub base_dn: Option<String>,
    pub service_accounts: Vec<String>,
    pub service_account_ous: Vec<String>,
    pub access_groups: Vec<String>,
    pub second_factor_groups: Vec<String>,
    pub second_factor_bypass_groups: Vec<String>,
    pub nested_groups: bool,
    pub load_profile: bool,
    pub identity_format: Option<IdentityFormat>,
    pub transform_before_first_factor: Vec<TransformRule>,
    pub transform_before_second_factor: Vec<TransformRule>,
    pub privacy_mode: PrivacyMode,
    pub privacy_fields: Vec<String>,
    pub auth_cache_ttl: Duration,
    pub bind_delay_min: Duration,
    pub bind_delay_max: Duration,
}

impl ClientPolicy {
    pub fn matches_ip(&self, peer: IpAddr) -> bool {
        self.source_ips.contains(&peer)
    }

    pub fn is_catch_all(&self) -> bool {
        self.source_ips.is_empty()
    }

    /// Exact account-name match or an OU substring match against a bind DN,
    /// both case-independent.
    pub fn is_service_account(&self, name: &str) -> bool {
        if self
            .service_accounts
            .iter()
            .any(|a| a.eq_ignore_ascii_case(name))
        {
            return true;
        }
        let lower = name.to_lowercase();
        self.service_account_ous
            .iter()
            .any(|ou| lower.contains(&ou.to_lowercase()))
    }

    pub fn wants_groups(&self) -> bool {
        !self.access_groups.is_empty()
            || !self.second_factor_groups.is_empty()
            || !self.second_factor_bypass_groups.is_empty()
    }

    /// Whether the post-bind pipeline must have a directory profile.
    pub fn needs_profile(&self) -> bool {
        self.load_profile || self.identity_format.is_some() || self.wants_groups()
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Checks that do not depend on policy compilation.
    pub fn validate(&self) -> Result<()> {
        let (_, listener_tls) =
            crate::server::parse_listen_url(&self.server.listen).context("server.listen")?;
        if listener_tls && (self.server.tls_cert_file.is_none() || self.server.tls_key_file.is_none())
        {
            bail!("ldaps:// listener needs tls_cert_file and tls_key_file");
        }
        if !self.server.ldap_server.starts_with("ldap://")
            && !self.server.ldap_server.starts_with("ldaps://")
        {
            bail!(
                "ldap_server must be an ldap:// or ldaps:// URL, got {:?}",
                self.server.ldap_server
            );
        }
        if self.api.urls.is_empty() {
            bail!("api.urls must list at least one endpoint");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                listen: "ldap://127.0.0.1:1389".to_string(),
                ldap_server: "ldap://127.0.0.1:389".to_string(),
                tls_cert_file: None,
                tls_key_file: None,
                backend_tls_skip_verify: false,
                backend_tls_ca_file: None,
                metrics_listen: None,
            },
            api: ApiConfig {
                urls: vec!["https://127.0.0.1:8443".to_string()],
                key: String::new(),
                secret: String::new(),
                timeout_secs: default_api_timeout(),
                bypass_second_factor_when_unreachable: false,
            },
            clients: vec![ClientConfig::default()],
        }
    }
}

/// Parsed file plus compiled policies, the unit an atomic reload swaps.
pub struct ProxyConfig {
    pub config: Config,
    pub policies: Vec<Arc<ClientPolicy>>,
}

impl ProxyConfig {
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let policies = config
            .clients
            .iter()
            .map(|c| c.compile().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProxyConfig { config, policies })
    }

    /// First client block listing the peer address wins; with no address
    /// match the first catch-all block takes it. None refuses the connection.
    pub fn policy_for_peer(&self, peer: IpAddr) -> Option<Arc<ClientPolicy>> {
        self.policies
            .iter()
            .find(|p| p.matches_ip(peer))
            .or_else(|| self.policies.iter().find(|p| p.is_catch_all()))
            .cloned()
    }
}

/// Live configuration handle. Sessions snapshot it at accept time; reload
/// swaps the whole ProxyConfig so later accepts see the new file.
#[derive(Clone)]
pub struct LiveConfig {
    current: Arc<ArcSwap<ProxyConfig>>,
    path: Arc<PathBuf>,
}

impl LiveConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config =
            Config::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
        let proxy = ProxyConfig::from_config(config)?;
        Ok(LiveConfig {
            current: Arc::new(ArcSwap::from_pointee(proxy)),
            path: Arc::new(path),
        })
    }

    /// Handle without a backing file; reload is not available. For tests and
    /// embedded use.
    pub fn from_config(config: Config) -> Result<Self> {
        Ok(LiveConfig {
            current: Arc::new(ArcSwap::from_pointee(ProxyConfig::from_config(config)?)),
            path: Arc::new(PathBuf::new()),
        })
    }

    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.load_full()
    }

    /// Re-read the backing file and swap. A file that fails to parse or
    /// compile leaves the running configuration untouched.
    pub fn reload(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            bail!("this configuration has no backing file");
        }
        let config = Config::from_file(self.path.as_ref())
            .with_context(|| format!("reloading {}", self.path.display()))?;
        let proxy = ProxyConfig::from_config(config)?;
        self.current.store(Arc::new(proxy));
        Ok(())
    }
}

/// Reload the configuration on SIGHUP for the life of the process.
#[cfg(unix)]
pub fn spawn_sighup_reload(live: LiveConfig) {
    use tokio::signal::unix::{signal, SignalKind};
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install the SIGHUP handler: {e}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            match live.reload() {
                Ok(()) => info!("configuration reloaded"),
                Err(e) => error!("configuration reload failed, keeping the previous one: {e:#}"),
            }
        }
    });
}
