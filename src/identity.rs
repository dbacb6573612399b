// Username spelling classification and translation. The directory knows the
// same user as j.doe, CORP\j.doe, j.doe@corp.example and a full DN; policy
// may demand one canonical spelling before the second factor.

use crate::directory::Profile;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

/// Structural spelling of a login name as it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    SamAccountName,
    UserPrincipalName,
    /// user@NETBIOS, the at-form with a dotless domain part
    UidAndNetbios,
    /// NETBIOS\user
    NetbiosAndUid,
    DistinguishedName,
}

/// Canonical output format a client policy may demand before the second
/// factor is challenged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityFormat {
    Upn,
    SamAccountName,
    DistinguishedName,
}

/// NetBIOS name to DNS domain mapping supplied by the directory.
#[derive(Debug, Clone, Default)]
pub struct DomainTable {
    entries: Vec<DomainEntry>,
}

#[derive(Debug, Clone)]
pub struct DomainEntry {
    pub domain: String,
    pub netbios: String,
}

impl DomainTable {
    pub fn new(entries: Vec<DomainEntry>) -> Self {
        DomainTable { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn domain_for_netbios(&self, netbios: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.netbios.eq_ignore_ascii_case(netbios))
            .map(|e| e.domain.as_str())
    }
}

fn dn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?i)\s*[a-z][a-z0-9-]*\s*=[^,]+(\s*,\s*[a-z][a-z0-9-]*\s*=[^,]+)*\s*$")
            .expect("static pattern")
    })
}

/// Classify a login name by structure alone, case-independent.
pub fn classify(name: &str) -> NameKind {
    if name.contains('\\') {
        return NameKind::NetbiosAndUid;
    }
    if name.to_lowercase().contains("cn=") && dn_pattern().is_match(name) {
        return NameKind::DistinguishedName;
    }
    if let Some((_, domain)) = name.split_once('@') {
        if domain.contains('.') {
            return NameKind::UserPrincipalName;
        }
        return NameKind::UidAndNetbios;
    }
    NameKind::SamAccountName
}

/// Render a login name in the demanded format. Fail-open: anything that
/// cannot be translated with the available context comes back unchanged,
/// with a log line instead of an error.
pub fn format_name(
    name: &str,
    target: IdentityFormat,
    domains: &DomainTable,
    profile: Option<&Profile>,
) -> String {
    let kind = classify(name);
    match target {
        IdentityFormat::Upn => to_upn(name, kind, domains, profile.and_then(|p| p.upn.as_deref())),
        IdentityFormat::SamAccountName => to_sam(name, kind, profile),
        IdentityFormat::DistinguishedName => match profile {
            Some(p) => p.dn.clone(),
            None => {
                warn!("cannot format {name} as a DN without a directory profile");
                name.to_string()
            }
        },
    }
}

fn to_upn(name: &str, kind: NameKind, domains: &DomainTable, profile_upn: Option<&str>) -> String {
    match kind {
        NameKind::UserPrincipalName => name.to_string(),
        NameKind::SamAccountName | NameKind::DistinguishedName => match profile_upn {
            Some(upn) => upn.to_string(),
            None => {
                warn!("no profile UPN to resolve {name}, keeping it as-is");
                name.to_string()
            }
        },
        NameKind::NetbiosAndUid => {
            let (netbios, uid) = name.split_once('\\').unwrap_or((name, ""));
            match domains.domain_for_netbios(netbios) {
                Some(domain) => format!("{uid}@{domain}"),
                None => {
                    warn!("NetBIOS name {netbios} not in the domain table, keeping {name}");
                    name.to_string()
                }
            }
        }
        NameKind::UidAndNetbios => {
            let (uid, netbios) = name.split_once('@').unwrap_or((name, ""));
            match domains.domain_for_netbios(netbios) {
                Some(domain) => format!("{uid}@{domain}"),
                None => {
                    warn!("NetBIOS name {netbios} not in the domain table, keeping {name}");
                    name.to_string()
                }
            }
        }
    }
}

fn to_sam(name: &str, kind: NameKind, profile: Option<&Profile>) -> String {
    match kind {
        NameKind::SamAccountName => name.to_string(),
        NameKind::NetbiosAndUid => name
            .split_once('\\')
            .map(|(_, uid)| uid.to_string())
            .unwrap_or_else(|| name.to_string()),
        NameKind::UserPrincipalName | NameKind::UidAndNetbios => name
            .split_once('@')
            .map(|(uid, _)| uid.to_string())
            .unwrap_or_else(|| name.to_string()),
        NameKind::DistinguishedName => match profile.and_then(|p| p.uid.as_deref()) {
            Some(uid) => uid.to_string(),
            None => {
                warn!("no profile uid to shorten {name}, keeping it as-is");
                name.to_string()
            }
        },
    }
}
