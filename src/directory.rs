// Synthetic directory queries. After a successful first factor the proxy asks
// the directory about the user over the session's own backend stream, using
// the client's bound credentials. Message IDs come from a high range no real
// client reaches, so responses can be told apart from in-flight client
// traffic; anything that is not ours is relayed to the client in arrival
// order.

use crate::framing::Framer;
use crate::identity::{classify, DomainEntry, DomainTable, NameKind};
use crate::protocol::{self, Filter, Packet, ProtocolOp, SearchEntry, SearchScope};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// LDAP_MATCHING_RULE_IN_CHAIN: makes an AD server walk nested group
/// membership inside one query instead of the proxy recursing itself.
pub const MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

/// First synthetic message ID. Clients allocate upward from 1; this range
/// sits just under the top of the 31-bit space.
const SYNTHETIC_ID_BASE: i32 = i32::MAX - 0xFFFF;

/// One query must answer within this window or the session is torn down.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

const PROFILE_ATTRS: [&str; 6] = [
    "distinguishedName",
    "displayName",
    "mail",
    "userPrincipalName",
    "uid",
    "sAMAccountName",
];

/// What the directory knows about one user, as far as the proxy cares.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub dn: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub upn: Option<String>,
    pub uid: Option<String>,
    pub groups: Vec<String>,
}

impl Profile {
    pub fn from_entry(entry: &SearchEntry) -> Profile {
        let dn = entry
            .first("distinguishedName")
            .unwrap_or(&entry.object_name)
            .to_string();
        Profile {
            dn,
            display_name: entry.first("displayName").map(str::to_string),
            email: entry.first("mail").map(str::to_string),
            upn: entry.first("userPrincipalName").map(str::to_string),
            uid: entry
                .first("uid")
                .or_else(|| entry.first("sAMAccountName"))
                .map(str::to_string),
            groups: Vec::new(),
        }
    }
}

/// The leading CN= component of a group DN, which is how groups are named in
/// client policy lists.
pub fn group_common_name(dn: &str) -> Option<String> {
    let (attr, value) = dn.split(',').next()?.split_once('=')?;
    if attr.trim().eq_ignore_ascii_case("cn") {
        Some(value.trim().to_string())
    } else {
        None
    }
}

/// Issues searches over borrowed halves of a live session. The caller holds
/// the backend write lock for as long as this value exists, so queries never
/// interleave with forwarded client packets.
pub struct DirectoryClient<'a, W, R, C> {
    backend_write: &'a mut W,
    backend_read: &'a mut R,
    client_write: &'a mut C,
    framer: &'a mut Framer,
    next_message_id: i32,
}

impl<'a, W, R, C> DirectoryClient<'a, W, R, C>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    pub fn new(
        backend_write: &'a mut W,
        backend_read: &'a mut R,
        client_write: &'a mut C,
        framer: &'a mut Framer,
    ) -> Self {
        DirectoryClient {
            backend_write,
            backend_read,
            client_write,
            framer,
            next_message_id: SYNTHETIC_ID_BASE,
        }
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// One search request/response exchange. Stray packets (responses to the
    /// client's own earlier requests) are relayed to the client as they
    /// arrive; entries for our message ID are collected until the matching
    /// SearchResultDone.
    pub async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        attributes: &[&str],
    ) -> Result<Vec<SearchEntry>> {
        let id = self.next_id();
        debug!("directory query {id}: base {base:?} filter {filter:?}");
        let request = protocol::search_request(id, base, scope, filter, attributes);
        self.backend_write.write_all(&request.to_bytes()).await?;
        self.backend_write.flush().await?;

        let collect = async {
            let mut entries = Vec::new();
            loop {
                let frame = self.framer.read_packet(&mut *self.backend_read).await?;
                if frame.is_end_of_stream() {
                    bail!("backend closed during directory query");
                }
                if !frame.valid {
                    bail!("backend sent an unframeable packet during directory query");
                }
                let packet = Packet::decode(&frame.bytes)
                    .context("undecodable backend packet during directory query")?;
                if packet.message_id() != id {
                    self.client_write.write_all(&frame.bytes).await?;
                    self.client_write.flush().await?;
                    continue;
                }
                match packet.classify() {
                    ProtocolOp::SearchResultEntry(op) => {
                        entries.push(protocol::parse_search_entry(op)?);
                    }
                    ProtocolOp::SearchResultDone(op) => {
                        let result = protocol::parse_ldap_result(op)?;
                        if !result.is_success() {
                            debug!(
                                "directory query {id} finished with {}: {}",
                                result.describe(),
                                result.diagnostic
                            );
                        }
                        return Ok(entries);
                    }
                    // SearchResultReference and friends carry nothing we need
                    _ => debug!("ignoring op in directory query {id}"),
                }
            }
        };
        match tokio::time::timeout(QUERY_TIMEOUT, collect).await {
            Ok(entries) => entries,
            Err(_) => bail!("directory query against {base:?} timed out"),
        }
    }

    /// defaultNamingContext from the rootDSE, the directory's own idea of its
    /// base DN.
    pub async fn base_dn(&mut self) -> Result<Option<String>> {
        let entries = self
            .search(
                "",
                SearchScope::BaseObject,
                &Filter::Present("objectClass".to_string()),
                &["defaultNamingContext"],
            )
            .await?;
        Ok(entries
            .first()
            .and_then(|e| e.first("defaultNamingContext"))
            .map(str::to_string))
    }

    /// Look the user up by whatever spelling the login arrived in. A DN is
    /// read back directly; everything else becomes an equality search under
    /// the base DN.
    pub async fn find_profile(&mut self, base_dn: &str, login: &str) -> Result<Option<Profile>> {
        let (base, scope, filter) = match classify(login) {
            NameKind::DistinguishedName => (
                login.to_string(),
                SearchScope::BaseObject,
                Filter::Present("objectClass".to_string()),
            ),
            NameKind::UserPrincipalName => (
                base_dn.to_string(),
                SearchScope::WholeSubtree,
                Filter::Equality("userPrincipalName".to_string(), login.to_string()),
            ),
            kind => {
                let uid = match kind {
                    NameKind::NetbiosAndUid => {
                        login.split_once('\\').map(|(_, u)| u).unwrap_or(login)
                    }
                    NameKind::UidAndNetbios => {
                        login.split_once('@').map(|(u, _)| u).unwrap_or(login)
                    }
                    _ => login,
                };
                (
                    base_dn.to_string(),
                    SearchScope::WholeSubtree,
                    Filter::Or(vec![
                        Filter::Equality("sAMAccountName".to_string(), uid.to_string()),
                        Filter::Equality("uid".to_string(), uid.to_string()),
                    ]),
                )
            }
        };
        let entries = self.search(&base, scope, &filter, &PROFILE_ATTRS).await?;
        if entries.len() > 1 {
            warn!(
                "profile search for {login} matched {} entries, using the first",
                entries.len()
            );
        }
        Ok(entries.first().map(Profile::from_entry))
    }

    /// Common names of the groups the user belongs to. With `nested` the
    /// directory walks transitive membership itself via the in-chain matching
    /// rule; without it only direct membership counts.
    pub async fn group_names(
        &mut self,
        base_dn: &str,
        user_dn: &str,
        nested: bool,
    ) -> Result<Vec<String>> {
        let filter = if nested {
            Filter::ExtensibleMatch {
                rule: MATCHING_RULE_IN_CHAIN.to_string(),
                attribute: "member".to_string(),
                value: user_dn.to_string(),
            }
        } else {
            Filter::Equality("member".to_string(), user_dn.to_string())
        };
        let entries = self
            .search(
                base_dn,
                SearchScope::WholeSubtree,
                &filter,
                &["distinguishedName"],
            )
            .await?;
        Ok(entries
            .iter()
            .filter_map(|e| {
                let dn = e.first("distinguishedName").unwrap_or(&e.object_name);
                group_common_name(dn)
            })
            .collect())
    }

    /// NetBIOS to DNS domain mapping from the AD Partitions container. Only
    /// crossRef entries carrying a nETBIOSName are domain partitions.
    pub async fn domain_table(&mut self, base_dn: &str) -> Result<DomainTable> {
        let base = format!("CN=Partitions,CN=Configuration,{base_dn}");
        let entries = self
            .search(
                &base,
                SearchScope::SingleLevel,
                &Filter::Present("nETBIOSName".to_string()),
                &["nETBIOSName", "dnsRoot"],
            )
            .await?;
        let mapped = entries
            .iter()
            .filter_map(|e| {
                Some(DomainEntry {
                    netbios: e.first("nETBIOSName")?.to_string(),
                    domain: e.first("dnsRoot")?.to_string(),
                })
            })
            .collect();
        Ok(DomainTable::new(mapped))
    }
}
