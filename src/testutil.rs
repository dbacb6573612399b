// Wire-level packet builders shared by the module tests. Everything here
// produces finished byte vectors so tests can write them straight into a
// duplex stream.

use crate::ber::{Node, Tag};
use crate::framing::Framer;
use crate::protocol::{
    Packet, APP_BIND_REQUEST, APP_BIND_RESPONSE, APP_SEARCH_RESULT_DONE, APP_SEARCH_RESULT_ENTRY,
};
use tokio::io::AsyncRead;

/// Read one valid frame and decode it, panicking on anything else.
pub(crate) async fn read_request<S>(framer: &mut Framer, stream: &mut S) -> Packet
where
    S: AsyncRead + Unpin,
{
    let frame = framer.read_packet(stream).await.expect("read frame");
    assert!(frame.valid, "expected a well-formed frame");
    Packet::decode(&frame.bytes).expect("decode packet")
}

/// Simple BindRequest with a version-3 header.
pub(crate) fn bind_request_packet(message_id: i32, name: &str, password: &str) -> Vec<u8> {
    let op = Node::constructed(
        Tag::application(APP_BIND_REQUEST),
        vec![
            Node::integer(3),
            Node::octet_string(name.as_bytes()),
            Node::leaf(Tag::context(0), password.as_bytes()),
        ],
    );
    Node::sequence(vec![Node::integer(message_id), op]).to_bytes()
}

/// BindResponse carrying a bare result code.
pub(crate) fn bind_response_packet(message_id: i32, code: u8) -> Vec<u8> {
    let op = Node::constructed(
        Tag::application(APP_BIND_RESPONSE),
        vec![
            Node::enumerated(code),
            Node::octet_string(Vec::new()),
            Node::octet_string(Vec::new()),
        ],
    );
    Node::sequence(vec![Node::integer(message_id), op]).to_bytes()
}

/// SearchResultEntry with string attribute values.
pub(crate) fn entry_packet(message_id: i32, dn: &str, attrs: &[(&str, &[&str])]) -> Vec<u8> {
    let attr_list = attrs
        .iter()
        .map(|(name, values)| {
            Node::sequence(vec![
                Node::octet_string(name.as_bytes()),
                Node::set(
                    values
                        .iter()
                        .map(|v| Node::octet_string(v.as_bytes()))
                        .collect(),
                ),
            ])
        })
        .collect();
    let op = Node::constructed(
        Tag::application(APP_SEARCH_RESULT_ENTRY),
        vec![Node::octet_string(dn.as_bytes()), Node::sequence(attr_list)],
    );
    Node::sequence(vec![Node::integer(message_id), op]).to_bytes()
}

/// SearchResultDone with the given result code.
pub(crate) fn done_packet(message_id: i32, code: u8) -> Vec<u8> {
    let op = Node::constructed(
        Tag::application(APP_SEARCH_RESULT_DONE),
        vec![
            Node::enumerated(code),
            Node::octet_string(Vec::new()),
            Node::octet_string(Vec::new()),
        ],
    );
    Node::sequence(vec![Node::integer(message_id), op]).to_bytes()
}
