// Bind mechanism classification and credential extraction. The proxy only
// understands Simple, NTLM, SPNEGO-wrapped NTLM and DIGEST-MD5; anything else
// (Kerberos and friends) is left alone and passed through.

use crate::ber::{Node, Tag, TAG_OCTET_STRING};
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::sync::OnceLock;

pub const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const SASL_MECHANISM_DIGEST_MD5: &str = "DIGEST-MD5";
const SASL_MECHANISM_GSS_SPNEGO: &str = "GSS-SPNEGO";

/// Closed set of bind mechanisms the proxy can read a username out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMechanism {
    Simple,
    Ntlm,
    SpnegoNtlm,
    DigestMd5,
}

impl BindMechanism {
    pub fn name(self) -> &'static str {
        match self {
            BindMechanism::Simple => "simple",
            BindMechanism::Ntlm => "ntlm",
            BindMechanism::SpnegoNtlm => "spnego-ntlm",
            BindMechanism::DigestMd5 => "digest-md5",
        }
    }

    /// Extract the claimed username out of the BindRequest operation node.
    ///
    /// `Ok(None)` means this leg carries no username (anonymous simple bind,
    /// NTLM negotiate/challenge, DIGEST-MD5 without a response yet); `Err`
    /// means the credential blob is malformed. The caller treats both as
    /// "nothing to intercept".
    pub fn extract_username(self, bind_op: &Node) -> Result<Option<String>> {
        match self {
            BindMechanism::Simple => {
                let name = bind_op
                    .child(1)
                    .context("BindRequest has no name")?
                    .as_str()
                    .context("Bind name is not UTF-8")?;
                // "NTLM" as a simple bind name is the sicily negotiation marker
                if name.is_empty() || name == "NTLM" {
                    Ok(None)
                } else {
                    Ok(Some(name.to_string()))
                }
            }
            BindMechanism::Ntlm => {
                let auth = bind_op
                    .child(2)
                    .context("BindRequest has no authentication choice")?;
                parse_ntlm_username(auth.value())
            }
            BindMechanism::SpnegoNtlm => {
                let token = sasl_credentials(bind_op)
                    .and_then(|creds| find_ntlm_token(creds.value()))
                    .context("SPNEGO credentials carry no NTLM token")?;
                parse_ntlm_username(token)
            }
            BindMechanism::DigestMd5 => {
                let creds = match sasl_credentials(bind_op) {
                    Some(node) => node,
                    None => return Ok(None),
                };
                let text =
                    std::str::from_utf8(creds.value()).context("DIGEST-MD5 credentials are not UTF-8")?;
                Ok(digest_username_pattern()
                    .captures(text)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()))
            }
        }
    }

    /// Usernames are only ever rewritten inside Simple binds; NTLM blobs and
    /// DIGEST responses are integrity-bound to their challenge.
    pub fn supports_rewrite(self) -> bool {
        matches!(self, BindMechanism::Simple)
    }

    /// New BindRequest operation with the bind name replaced, preserving the
    /// original name node's tag. None for mechanisms without rewrite support.
    pub fn rewrite_name(self, bind_op: &Node, new_name: &str) -> Option<Node> {
        if !self.supports_rewrite() {
            return None;
        }
        let tag = bind_op
            .child(1)
            .map(|n| n.tag())
            .unwrap_or_else(|| Tag::universal(TAG_OCTET_STRING));
        Some(bind_op.with_child(1, Node::leaf(tag, new_name.as_bytes())))
    }
}

/// Pure classification over the BindRequest's authentication choice (its
/// third child). None = mechanism the proxy does not understand.
pub fn classify(bind_op: &Node) -> Option<BindMechanism> {
    let auth = bind_op.child(2)?;
    if !auth.tag().constructed {
        if auth.value().starts_with(NTLMSSP_SIGNATURE) {
            return Some(BindMechanism::Ntlm);
        }
        return Some(BindMechanism::Simple);
    }
    // SASL: { mechanism, credentials OPTIONAL }
    let mechanism = auth.child(0)?.as_str().ok()?;
    match mechanism {
        SASL_MECHANISM_DIGEST_MD5 => Some(BindMechanism::DigestMd5),
        SASL_MECHANISM_GSS_SPNEGO => {
            let creds = auth.child(1)?;
            if find_ntlm_token(creds.value()).is_some() {
                Some(BindMechanism::SpnegoNtlm)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn sasl_credentials(bind_op: &Node) -> Option<&Node> {
    bind_op.child(2)?.child(1)
}

/// NTLM token embedded somewhere in a SPNEGO blob, located by its signature.
/// Security-buffer offsets are relative to the token start, so the returned
/// slice is the right base for parsing.
fn find_ntlm_token(data: &[u8]) -> Option<&[u8]> {
    data.windows(NTLMSSP_SIGNATURE.len())
        .position(|w| w == NTLMSSP_SIGNATURE)
        .map(|pos| &data[pos..])
}

/// Username out of an NTLM message. Type 1 (negotiate) and 2 (challenge)
/// carry none; type 3 (authenticate) holds it as a security buffer at offset
/// 36: 2-byte LE length, 2-byte reserved, 4-byte LE offset, UTF-16LE payload.
fn parse_ntlm_username(data: &[u8]) -> Result<Option<String>> {
    if data.len() < 12 || !data.starts_with(NTLMSSP_SIGNATURE) {
        bail!("NTLM token too short or missing signature");
    }
    match data[8] {
        1 | 2 => Ok(None),
        3 => {
            if data.len() < 44 {
                bail!("NTLM authenticate message truncated: {} bytes", data.len());
            }
            let len = u16::from_le_bytes([data[36], data[37]]) as usize;
            let offset = u32::from_le_bytes([data[40], data[41], data[42], data[43]]) as usize;
            if len == 0 {
                return Ok(None);
            }
            let end = offset
                .checked_add(len)
                .context("NTLM username field overflows")?;
            if end > data.len() {
                bail!("NTLM username field out of range: offset {offset} len {len}");
            }
            let raw = &data[offset..end];
            if raw.len() % 2 != 0 {
                bail!("NTLM username length is not a multiple of 2");
            }
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let name = String::from_utf16(&units).context("NTLM username is not valid UTF-16")?;
            Ok(Some(name))
        }
        other => bail!("Unknown NTLM message type: {}", other),
    }
}

fn digest_username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"username="([^"]*)""#).expect("static pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Tag;

    fn simple_bind_op(name: &str, password: &[u8]) -> Node {
        Node::constructed(
            Tag::application(0),
            vec![
                Node::integer(3),
                Node::octet_string(name.as_bytes()),
                Node::leaf(Tag::context(0), password),
            ],
        )
    }

    fn sasl_bind_op(mechanism: &str, credentials: &[u8]) -> Node {
        Node::constructed(
            Tag::application(0),
            vec![
                Node::integer(3),
                Node::octet_string(Vec::new()),
                Node::constructed(
                    Tag::context(3),
                    vec![
                        Node::octet_string(mechanism.as_bytes()),
                        Node::octet_string(credentials),
                    ],
                ),
            ],
        )
    }

    /// Minimal NTLM authenticate message: only the username buffer is filled.
    fn ntlm_type3(username: &str) -> Vec<u8> {
        let payload: Vec<u8> = username
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        let offset = 44u32;
        let mut blob = vec![0u8; offset as usize];
        blob[..8].copy_from_slice(NTLMSSP_SIGNATURE);
        blob[8] = 3;
        blob[36..38].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        blob[40..44].copy_from_slice(&offset.to_le_bytes());
        blob.extend_from_slice(&payload);
        blob
    }

    #[test]
    fn test_classify_simple_and_raw_ntlm() {
        let simple = simple_bind_op("cn=admin,dc=x", b"pw");
        assert_eq!(classify(&simple), Some(BindMechanism::Simple));

        let mut ntlm_blob = NTLMSSP_SIGNATURE.to_vec();
        ntlm_blob.extend_from_slice(&[1, 0, 0, 0]);
        let ntlm = Node::constructed(
            Tag::application(0),
            vec![
                Node::integer(3),
                Node::octet_string("NTLM".as_bytes()),
                Node::leaf(Tag::context(0), ntlm_blob),
            ],
        );
        assert_eq!(classify(&ntlm), Some(BindMechanism::Ntlm));
    }

    #[test]
    fn test_classify_sasl_mechanisms() {
        let digest = sasl_bind_op("DIGEST-MD5", b"");
        assert_eq!(classify(&digest), Some(BindMechanism::DigestMd5));

        let mut spnego = vec![0xA1, 0x10, 0x30, 0x0E]; // fake SPNEGO wrapping
        spnego.extend_from_slice(&ntlm_type3("u"));
        let wrapped = sasl_bind_op("GSS-SPNEGO", &spnego);
        assert_eq!(classify(&wrapped), Some(BindMechanism::SpnegoNtlm));

        // SPNEGO without an NTLM token inside is somebody else's problem
        let kerberos_ish = sasl_bind_op("GSS-SPNEGO", &[0xA0, 0x03, 0x0A, 0x01, 0x00]);
        assert_eq!(classify(&kerberos_ish), None);

        let gssapi = sasl_bind_op("GSSAPI", b"\x60\x23\x06\x09");
        assert_eq!(classify(&gssapi), None);
    }

    #[test]
    fn test_simple_extracts_name_and_legacy_marker() {
        let op = simple_bind_op("j.doe@corp.example", b"pw");
        assert_eq!(
            BindMechanism::Simple.extract_username(&op).unwrap(),
            Some("j.doe@corp.example".to_string())
        );

        // The literal name "NTLM" marks sicily negotiation, not a user
        let marker = simple_bind_op("NTLM", b"");
        assert_eq!(BindMechanism::Simple.extract_username(&marker).unwrap(), None);

        let anonymous = simple_bind_op("", b"");
        assert_eq!(
            BindMechanism::Simple.extract_username(&anonymous).unwrap(),
            None
        );
    }

    #[test]
    fn test_ntlm_type3_username_decodes() {
        let op = Node::constructed(
            Tag::application(0),
            vec![
                Node::integer(3),
                Node::octet_string(Vec::new()),
                Node::leaf(Tag::context(0), ntlm_type3("CORP\\j.doe")),
            ],
        );
        assert_eq!(
            BindMechanism::Ntlm.extract_username(&op).unwrap(),
            Some("CORP\\j.doe".to_string())
        );
    }

    #[test]
    fn test_ntlm_negotiate_has_no_username() {
        let mut blob = NTLMSSP_SIGNATURE.to_vec();
        blob.extend_from_slice(&[1, 0, 0, 0]);
        let op = Node::constructed(
            Tag::application(0),
            vec![
                Node::integer(3),
                Node::octet_string(Vec::new()),
                Node::leaf(Tag::context(0), blob),
            ],
        );
        assert_eq!(BindMechanism::Ntlm.extract_username(&op).unwrap(), None);
    }

    #[test]
    fn test_ntlm_malformed_is_an_error() {
        // Unknown message type
        let mut bad_type = ntlm_type3("x");
        bad_type[8] = 5;
        assert!(parse_ntlm_username(&bad_type).is_err());

        // Username buffer pointing past the end
        let mut bad_offset = ntlm_type3("x");
        bad_offset[40..44].copy_from_slice(&10_000u32.to_le_bytes());
        assert!(parse_ntlm_username(&bad_offset).is_err());

        assert!(parse_ntlm_username(b"NTLMSSP\0\x03").is_err());
        assert!(parse_ntlm_username(b"not-ntlm-data").is_err());
    }

    #[test]
    fn test_spnego_extracts_from_embedded_token() {
        let mut spnego = vec![0xDE, 0xAD, 0xBE, 0xEF];
        spnego.extend_from_slice(&ntlm_type3("alice"));
        let op = sasl_bind_op("GSS-SPNEGO", &spnego);
        assert_eq!(
            BindMechanism::SpnegoNtlm.extract_username(&op).unwrap(),
            Some("alice".to_string())
        );
    }

    #[test]
    fn test_digest_md5_pattern() {
        let creds =
            br#"charset=utf-8,username="alice",realm="corp",nonce="abc",nc=00000001"#;
        let op = sasl_bind_op("DIGEST-MD5", creds);
        assert_eq!(
            BindMechanism::DigestMd5.extract_username(&op).unwrap(),
            Some("alice".to_string())
        );

        // First SASL leg has no response string yet
        let empty = sasl_bind_op("DIGEST-MD5", b"");
        assert_eq!(BindMechanism::DigestMd5.extract_username(&empty).unwrap(), None);
    }

    #[test]
    fn test_rewrite_only_for_simple() {
        let op = simple_bind_op("j.doe", b"pw");
        let rewritten = BindMechanism::Simple
            .rewrite_name(&op, "uid=j.doe,dc=corp,dc=example")
            .unwrap();
        assert_eq!(
            rewritten.child(1).unwrap().as_str().unwrap(),
            "uid=j.doe,dc=corp,dc=example"
        );
        // Password child untouched
        assert_eq!(rewritten.child(2).unwrap().value(), b"pw");

        assert!(BindMechanism::Ntlm.rewrite_name(&op, "x").is_none());
        assert!(BindMechanism::DigestMd5.rewrite_name(&op, "x").is_none());
    }
}
