// BER tag-length-value codec for the LDAP wire format.
// Parses a packet into an owned node tree and serializes it back byte-exactly.

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Universal tag numbers used by LDAP.
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x10;
pub const TAG_SET: u8 = 0x11;

/// Nesting bound for hostile input; legitimate LDAP stays in single digits.
const MAX_PARSE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

/// One BER tag byte as a value: bits 7-6 class, bit 5 constructed, bits 4-0 number.
/// Immutable; conversion to and from the wire byte is a pure function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u8,
}

impl Tag {
    pub fn from_byte(byte: u8) -> Self {
        let class = match byte >> 6 {
            0 => TagClass::Universal,
            1 => TagClass::Application,
            2 => TagClass::Context,
            _ => TagClass::Private,
        };
        Tag {
            class,
            constructed: (byte & 0x20) != 0,
            number: byte & 0x1F,
        }
    }

    pub fn to_byte(self) -> u8 {
        let class_bits = match self.class {
            TagClass::Universal => 0u8,
            TagClass::Application => 1,
            TagClass::Context => 2,
            TagClass::Private => 3,
        };
        (class_bits << 6) | if self.constructed { 0x20 } else { 0 } | (self.number & 0x1F)
    }

    pub fn universal(number: u8) -> Self {
        Tag {
            class: TagClass::Universal,
            constructed: false,
            number,
        }
    }

    pub fn application(number: u8) -> Self {
        Tag {
            class: TagClass::Application,
            constructed: false,
            number,
        }
    }

    pub fn context(number: u8) -> Self {
        Tag {
            class: TagClass::Context,
            constructed: false,
            number,
        }
    }

    /// Same tag with the constructed bit set.
    pub fn constructed(self) -> Self {
        Tag {
            constructed: true,
            ..self
        }
    }

    pub fn is_universal(self, number: u8) -> bool {
        self.class == TagClass::Universal && self.number == number
    }
}

/// Controls how malformed nested content inside a constructed node is handled.
/// Strict fails the whole packet; Lenient logs and leaves the node childless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    #[default]
    Strict,
    Lenient,
}

/// One BER node: a tag plus either leaf bytes or an owned list of children.
/// A node is constructed iff it has children (an empty constructed node is the
/// degenerate empty-sequence case); encoding always recomputes lengths from
/// the live tree, never from a cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    tag: Tag,
    value: Vec<u8>,
    children: Vec<Node>,
}

impl Node {
    pub fn leaf(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Node {
            tag: Tag {
                constructed: false,
                ..tag
            },
            value: value.into(),
            children: Vec::new(),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<Node>) -> Self {
        Node {
            tag: tag.constructed(),
            value: Vec::new(),
            children,
        }
    }

    pub fn sequence(children: Vec<Node>) -> Self {
        Node::constructed(Tag::universal(TAG_SEQUENCE), children)
    }

    pub fn set(children: Vec<Node>) -> Self {
        Node::constructed(Tag::universal(TAG_SET), children)
    }

    /// 32-bit signed integer as its full 4-byte big-endian form, no
    /// minimal-length trimming. Message IDs on the wire keep a fixed width.
    pub fn integer(value: i32) -> Self {
        Node::leaf(Tag::universal(TAG_INTEGER), value.to_be_bytes().to_vec())
    }

    pub fn boolean(value: bool) -> Self {
        Node::leaf(Tag::universal(TAG_BOOLEAN), vec![u8::from(value)])
    }

    pub fn enumerated(value: u8) -> Self {
        Node::leaf(Tag::universal(TAG_ENUMERATED), vec![value])
    }

    pub fn octet_string(value: impl Into<Vec<u8>>) -> Self {
        Node::leaf(Tag::universal(TAG_OCTET_STRING), value)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn child(&self, index: usize) -> Option<&Node> {
        self.children.get(index)
    }

    /// Copy of this node with one child replaced. Used for in-flight rewrites
    /// (bind DN substitution) without mutating shared structure.
    pub fn with_child(&self, index: usize, child: Node) -> Node {
        let mut children = self.children.clone();
        if index < children.len() {
            children[index] = child;
        }
        Node {
            tag: self.tag,
            value: self.value.clone(),
            children,
        }
    }

    /// Integer decoding pads values shorter than 4 bytes with leading zeros
    /// before reinterpreting as big-endian.
    pub fn as_i32(&self) -> Result<i32> {
        if self.value.len() > 4 {
            bail!("Integer too large: {} bytes", self.value.len());
        }
        let mut buf = [0u8; 4];
        buf[4 - self.value.len()..].copy_from_slice(&self.value);
        Ok(i32::from_be_bytes(buf))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.value.first() {
            Some(&b) => Ok(b != 0),
            None => bail!("Boolean value is empty"),
        }
    }

    pub fn as_enumerated(&self) -> Result<u8> {
        match self.value.as_slice() {
            [b] => Ok(*b),
            other => bail!("Enumerated value must be 1 byte, got: {}", other.len()),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.value).context("Invalid UTF-8 string")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(self, &mut out);
        out
    }
}

pub fn encode(node: &Node) -> Vec<u8> {
    node.to_bytes()
}

fn encode_into(node: &Node, out: &mut Vec<u8>) {
    out.push(node.tag.to_byte());
    if node.tag.constructed {
        let mut content = Vec::new();
        for child in &node.children {
            encode_into(child, &mut content);
        }
        out.extend_from_slice(&encode_length(content.len()));
        out.extend_from_slice(&content);
    } else {
        out.extend_from_slice(&encode_length(node.value.len()));
        out.extend_from_slice(&node.value);
    }
}

/// BER length: short form for values <= 127, otherwise 0x80 | byte count
/// followed by that many big-endian length bytes.
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        vec![length as u8]
    } else {
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        let mut out = vec![0x80 | bytes.len() as u8];
        out.extend_from_slice(&bytes);
        out
    }
}

/// Decode a BER length from the start of `data`. Returns (length, bytes consumed).
pub fn decode_length(data: &[u8]) -> Result<(usize, usize)> {
    let first = match data.first() {
        Some(&b) => b,
        None => bail!("BER truncated: missing length byte"),
    };
    if (first & 0x80) == 0 {
        return Ok((first as usize, 1));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 {
        bail!("Indefinite length not supported");
    }
    if length_bytes > 4 {
        bail!("Length too large: {} bytes", length_bytes);
    }
    if data.len() < 1 + length_bytes {
        bail!(
            "BER truncated: length encoding needs {} bytes, {} remaining",
            length_bytes,
            data.len() - 1
        );
    }
    let mut length = 0usize;
    for &b in &data[1..1 + length_bytes] {
        length = (length << 8) | b as usize;
    }
    Ok((length, 1 + length_bytes))
}

/// Decode exactly one packet. Strict mode: any malformed nested content fails
/// the whole packet (the default).
pub fn decode(data: &[u8]) -> Result<Node> {
    decode_with_mode(data, DecodeMode::Strict)
}

pub fn decode_with_mode(data: &[u8], mode: DecodeMode) -> Result<Node> {
    let mut pos = 0usize;
    let node = parse_at(data, &mut pos, mode, 0)?;
    if pos != data.len() {
        bail!(
            "Trailing bytes after BER node: {} consumed, {} total",
            pos,
            data.len()
        );
    }
    Ok(node)
}

fn parse_at(data: &[u8], pos: &mut usize, mode: DecodeMode, depth: usize) -> Result<Node> {
    if depth > MAX_PARSE_DEPTH {
        bail!("BER nesting deeper than {} levels", MAX_PARSE_DEPTH);
    }
    let tag_byte = match data.get(*pos) {
        Some(&b) => b,
        None => bail!("BER truncated: missing tag byte"),
    };
    let tag = Tag::from_byte(tag_byte);
    *pos += 1;

    let (length, consumed) = decode_length(&data[*pos..])?;
    *pos += consumed;
    if data.len() - *pos < length {
        bail!(
            "BER truncated: value needs {} bytes, {} remaining",
            length,
            data.len() - *pos
        );
    }
    let content = &data[*pos..*pos + length];
    *pos += length;

    if tag.constructed {
        match parse_children(content, mode, depth + 1) {
            Ok(children) => Ok(Node {
                tag,
                value: Vec::new(),
                children,
            }),
            Err(e) if mode == DecodeMode::Lenient => {
                warn!("Malformed nested BER content left unparsed: {e:#}");
                Ok(Node {
                    tag,
                    value: Vec::new(),
                    children: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    } else {
        Ok(Node {
            tag,
            value: content.to_vec(),
            children: Vec::new(),
        })
    }
}

fn parse_children(content: &[u8], mode: DecodeMode, depth: usize) -> Result<Vec<Node>> {
    let mut children = Vec::new();
    let mut pos = 0usize;
    while pos < content.len() {
        children.push(parse_at(content, &mut pos, mode, depth)?);
    }
    Ok(children)
}
