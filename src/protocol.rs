// LDAP message layer over the BER codec: packet wrapper, request
// classification, result codes, bind response synthesis and the search
// request/entry shapes the proxy needs.

use crate::ber::{self, DecodeMode, Node, Tag, TagClass, TAG_INTEGER, TAG_SEQUENCE};
use anyhow::{bail, Context, Result};
use std::fmt;

// Application tag numbers (RFC 4511)
pub const APP_BIND_REQUEST: u8 = 0;
pub const APP_BIND_RESPONSE: u8 = 1;
pub const APP_SEARCH_REQUEST: u8 = 3;
pub const APP_SEARCH_RESULT_ENTRY: u8 = 4;
pub const APP_SEARCH_RESULT_DONE: u8 = 5;

/// RFC 4511 result codes the proxy reads or synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    Referral = 10,
    AdminLimitExceeded = 11,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    ConstraintViolation = 19,
    NoSuchObject = 32,
    InvalidDnSyntax = 34,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    Other = 80,
}

impl ResultCode {
    pub fn from_byte(byte: u8) -> Option<ResultCode> {
        use ResultCode::*;
        Some(match byte {
            0 => Success,
            1 => OperationsError,
            2 => ProtocolError,
            3 => TimeLimitExceeded,
            4 => SizeLimitExceeded,
            7 => AuthMethodNotSupported,
            8 => StrongerAuthRequired,
            10 => Referral,
            11 => AdminLimitExceeded,
            13 => ConfidentialityRequired,
            14 => SaslBindInProgress,
            16 => NoSuchAttribute,
            19 => ConstraintViolation,
            32 => NoSuchObject,
            34 => InvalidDnSyntax,
            48 => InappropriateAuthentication,
            49 => InvalidCredentials,
            50 => InsufficientAccessRights,
            51 => Busy,
            52 => Unavailable,
            53 => UnwillingToPerform,
            80 => Other,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ResultCode::*;
        let name = match self {
            Success => "success",
            OperationsError => "operationsError",
            ProtocolError => "protocolError",
            TimeLimitExceeded => "timeLimitExceeded",
            SizeLimitExceeded => "sizeLimitExceeded",
            AuthMethodNotSupported => "authMethodNotSupported",
            StrongerAuthRequired => "strongerAuthRequired",
            Referral => "referral",
            AdminLimitExceeded => "adminLimitExceeded",
            ConfidentialityRequired => "confidentialityRequired",
            SaslBindInProgress => "saslBindInProgress",
            NoSuchAttribute => "noSuchAttribute",
            ConstraintViolation => "constraintViolation",
            NoSuchObject => "noSuchObject",
            InvalidDnSyntax => "invalidDNSyntax",
            InappropriateAuthentication => "inappropriateAuthentication",
            InvalidCredentials => "invalidCredentials",
            InsufficientAccessRights => "insufficientAccessRights",
            Busy => "busy",
            Unavailable => "unavailable",
            UnwillingToPerform => "unwillingToPerform",
            Other => "other",
        };
        f.write_str(name)
    }
}

/// An LDAP message: a SEQUENCE whose first child is the message ID and whose
/// second child is the operation. Trailing children (controls) ride along
/// untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    root: Node,
    message_id: i32,
}

/// A packet classified by its operation tag. Views borrow the packet's
/// operation node; one is made per inbound packet and dropped after use.
#[derive(Debug)]
pub enum ProtocolOp<'a> {
    BindRequest(&'a Node),
    BindResponse(&'a Node),
    SearchRequest(&'a Node),
    SearchResultEntry(&'a Node),
    SearchResultDone(&'a Node),
    Generic,
}

impl Packet {
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        Self::decode_with_mode(bytes, DecodeMode::Strict)
    }

    pub fn decode_with_mode(bytes: &[u8], mode: DecodeMode) -> Result<Packet> {
        Self::from_node(ber::decode_with_mode(bytes, mode)?)
    }

    pub fn from_node(root: Node) -> Result<Packet> {
        if !root.tag().is_universal(TAG_SEQUENCE) || !root.tag().constructed {
            bail!("LDAP message must be a SEQUENCE, got tag 0x{:02X}", root.tag().to_byte());
        }
        let id_node = root.child(0).context("LDAP message has no message ID")?;
        if !id_node.tag().is_universal(TAG_INTEGER) {
            bail!("LDAP message ID must be an INTEGER");
        }
        let message_id = id_node.as_i32()?;
        if root.child(1).is_none() {
            bail!("LDAP message has no protocol operation");
        }
        Ok(Packet { root, message_id })
    }

    fn assemble(message_id: i32, op: Node) -> Packet {
        Packet {
            root: Node::sequence(vec![Node::integer(message_id), op]),
            message_id,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn op(&self) -> &Node {
        // Presence checked in from_node
        self.root.child(1).expect("packet without operation")
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.root.to_bytes()
    }

    /// Same message with the operation replaced; message ID and any trailing
    /// controls are preserved.
    pub fn with_op(&self, op: Node) -> Packet {
        Packet {
            root: self.root.with_child(1, op),
            message_id: self.message_id,
        }
    }

    pub fn classify(&self) -> ProtocolOp<'_> {
        let op = self.op();
        let tag = op.tag();
        if tag.class != TagClass::Application {
            return ProtocolOp::Generic;
        }
        match tag.number {
            APP_BIND_REQUEST if tag.constructed => ProtocolOp::BindRequest(op),
            APP_BIND_RESPONSE if tag.constructed => ProtocolOp::BindResponse(op),
            APP_SEARCH_REQUEST if tag.constructed => ProtocolOp::SearchRequest(op),
            APP_SEARCH_RESULT_ENTRY if tag.constructed => ProtocolOp::SearchResultEntry(op),
            APP_SEARCH_RESULT_DONE if tag.constructed => ProtocolOp::SearchResultDone(op),
            _ => ProtocolOp::Generic,
        }
    }

    /// Minimal BindResponse: result code, empty matched DN, diagnostic text.
    pub fn bind_response(message_id: i32, code: ResultCode, diagnostic: &str) -> Packet {
        let op = Node::constructed(
            Tag::application(APP_BIND_RESPONSE),
            vec![
                Node::enumerated(code.as_byte()),
                Node::octet_string(Vec::new()),
                Node::octet_string(diagnostic.as_bytes().to_vec()),
            ],
        );
        Packet::assemble(message_id, op)
    }
}

/// The LDAPResult prefix shared by BindResponse and SearchResultDone.
#[derive(Debug, Clone)]
pub struct LdapResult {
    pub code_byte: u8,
    pub code: Option<ResultCode>,
    pub matched_dn: String,
    pub diagnostic: String,
}

impl LdapResult {
    pub fn is_success(&self) -> bool {
        self.code_byte == ResultCode::Success.as_byte()
    }

    pub fn is_sasl_in_progress(&self) -> bool {
        self.code_byte == ResultCode::SaslBindInProgress.as_byte()
    }

    /// Human-readable code for logs: RFC name when known, raw byte otherwise.
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => code.to_string(),
            None => format!("resultCode {}", self.code_byte),
        }
    }
}

pub fn parse_ldap_result(op: &Node) -> Result<LdapResult> {
    let code_byte = op
        .child(0)
        .context("LDAPResult has no result code")?
        .as_enumerated()?;
    let matched_dn = op
        .child(1)
        .map(|n| String::from_utf8_lossy(n.value()).into_owned())
        .unwrap_or_default();
    let diagnostic = op
        .child(2)
        .map(|n| String::from_utf8_lossy(n.value()).into_owned())
        .unwrap_or_default();
    Ok(LdapResult {
        code_byte,
        code: ResultCode::from_byte(code_byte),
        matched_dn,
        diagnostic,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

/// The filter shapes the proxy reads and writes. Anything else in a client
/// filter is walked over, never interpreted.
#[derive(Debug, Clone)]
pub enum Filter {
    Present(String),
    Equality(String, String),
    Or(Vec<Filter>),
    ExtensibleMatch {
        rule: String,
        attribute: String,
        value: String,
    },
}

impl Filter {
    fn to_node(&self) -> Node {
        match self {
            // present: [7] primitive, the attribute description itself
            Filter::Present(attr) => Node::leaf(Tag::context(7), attr.as_bytes()),
            // equalityMatch: [3] { attributeDesc, assertionValue }
            Filter::Equality(attr, value) => Node::constructed(
                Tag::context(3),
                vec![
                    Node::octet_string(attr.as_bytes()),
                    Node::octet_string(value.as_bytes()),
                ],
            ),
            // or: [1] SET OF filter
            Filter::Or(alternatives) => Node::constructed(
                Tag::context(1),
                alternatives.iter().map(Filter::to_node).collect(),
            ),
            // extensibleMatch: [9] { matchingRule [1], type [2], matchValue [3] }
            Filter::ExtensibleMatch {
                rule,
                attribute,
                value,
            } => Node::constructed(
                Tag::context(9),
                vec![
                    Node::leaf(Tag::context(1), rule.as_bytes()),
                    Node::leaf(Tag::context(2), attribute.as_bytes()),
                    Node::leaf(Tag::context(3), value.as_bytes()),
                ],
            ),
        }
    }
}

/// Assemble a SearchRequest packet (no size/time limits, attributes only).
pub fn search_request(
    message_id: i32,
    base: &str,
    scope: SearchScope,
    filter: &Filter,
    attributes: &[&str],
) -> Packet {
    let attrs = Node::sequence(
        attributes
            .iter()
            .map(|a| Node::octet_string(a.as_bytes()))
            .collect(),
    );
    let op = Node::constructed(
        Tag::application(APP_SEARCH_REQUEST),
        vec![
            Node::octet_string(base.as_bytes()),
            Node::enumerated(scope as u8),
            Node::enumerated(0), // neverDerefAliases
            Node::integer(0),
            Node::integer(0),
            Node::boolean(false),
            filter.to_node(),
            attrs,
        ],
    );
    Packet::assemble(message_id, op)
}

/// Attributes whose equality lookup marks a user DN search worth correlating.
const LOGIN_LOOKUP_ATTRS: [&str; 4] = ["cn", "uid", "samaccountname", "userprincipalname"];

/// The looked-up login name, if this SearchRequest's filter equality-tests a
/// login attribute anywhere in its and/or/not tree.
pub fn user_lookup_value(op: &Node) -> Option<String> {
    let filter = op.child(6)?;
    find_login_equality(filter)
}

fn find_login_equality(filter: &Node) -> Option<String> {
    let tag = filter.tag();
    if tag.class != TagClass::Context {
        return None;
    }
    match tag.number {
        // equalityMatch
        3 if tag.constructed => {
            let attr = filter.child(0)?.as_str().ok()?.to_lowercase();
            if LOGIN_LOOKUP_ATTRS.contains(&attr.as_str()) {
                Some(String::from_utf8_lossy(filter.child(1)?.value()).into_owned())
            } else {
                None
            }
        }
        // and / or / not wrap nested filters
        0..=2 if tag.constructed => filter.children().iter().find_map(find_login_equality),
        _ => None,
    }
}

/// One SearchResultEntry: object name plus attribute values decoded as UTF-8.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub object_name: String,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl SearchEntry {
    pub fn first(&self, attr: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn all(&self, attr: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(attr))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }
}

pub fn parse_search_entry(op: &Node) -> Result<SearchEntry> {
    let object_name = String::from_utf8_lossy(
        op.child(0)
            .context("SearchResultEntry has no object name")?
            .value(),
    )
    .into_owned();
    let mut attributes = Vec::new();
    if let Some(attr_list) = op.child(1) {
        for attr in attr_list.children() {
            let name = match attr.child(0) {
                Some(n) => String::from_utf8_lossy(n.value()).into_owned(),
                None => continue,
            };
            let values = attr
                .child(1)
                .map(|set| {
                    set.children()
                        .iter()
                        .map(|v| String::from_utf8_lossy(v.value()).into_owned())
                        .collect()
                })
                .unwrap_or_default();
            attributes.push((name, values));
        }
    }
    Ok(SearchEntry {
        object_name,
        attributes,
    })
}
