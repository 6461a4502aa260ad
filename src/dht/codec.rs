//! CBOR wire codec for the datagram protocol.
//!
//! Every datagram is one CBOR map with the envelope fields `t` (txid),
//! `v` (version word) and `id` (sender), plus exactly one of `q`/`r`/`e`
//! carrying the method-tagged body. Encoding is canonical: fields are
//! written in declaration order with minimal-width integers, so
//! re-encoding a decoded message reproduces the input bytes. Unknown
//! envelope keys fail decoding, and both directions enforce the MTU.

use super::MTU;
use crate::error::{Error, ErrorCode, Result};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::NodeInfo;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Cap on the node hints a single response may carry per family.
pub const MAX_NODES_PER_RESPONSE: usize = 16;
/// Cap on peer records in a single response.
pub const MAX_PEERS_PER_RESPONSE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    FindValue,
    StoreValue,
    FindPeer,
    AnnouncePeer,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::FindValue => "find_value",
            Method::StoreValue => "store_value",
            Method::FindPeer => "find_peer",
            Method::AnnouncePeer => "announce_peer",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "t")]
    pub txid: u32,
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "id")]
    pub sender: Id,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r")]
    Response(Response),
    #[serde(rename = "e")]
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    #[serde(rename = "ping")]
    Ping {},

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "tgt")]
        target: Id,
        #[serde(rename = "w4")]
        want4: bool,
        #[serde(rename = "w6")]
        want6: bool,
        #[serde(rename = "tok")]
        want_token: bool,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "tgt")]
        target: Id,
        #[serde(rename = "w4")]
        want4: bool,
        #[serde(rename = "w6")]
        want6: bool,
        #[serde(rename = "tok")]
        want_token: bool,
        #[serde(rename = "seq")]
        expected_seq: Option<i32>,
    },

    #[serde(rename = "store_value")]
    StoreValue {
        #[serde(rename = "tok")]
        token: u32,
        #[serde(rename = "val")]
        value: Value,
        #[serde(rename = "cas")]
        expected_seq: Option<i32>,
    },

    #[serde(rename = "find_peer")]
    FindPeer {
        #[serde(rename = "tgt")]
        target: Id,
        #[serde(rename = "w4")]
        want4: bool,
        #[serde(rename = "w6")]
        want6: bool,
        #[serde(rename = "tok")]
        want_token: bool,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        #[serde(rename = "tok")]
        token: u32,
        #[serde(rename = "p")]
        peer: PeerInfo,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    #[serde(rename = "ping")]
    Ping {},

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "n4")]
        nodes4: Option<Vec<NodeInfo>>,
        #[serde(rename = "n6")]
        nodes6: Option<Vec<NodeInfo>>,
        #[serde(rename = "tok")]
        token: Option<u32>,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "n4")]
        nodes4: Option<Vec<NodeInfo>>,
        #[serde(rename = "n6")]
        nodes6: Option<Vec<NodeInfo>>,
        #[serde(rename = "tok")]
        token: Option<u32>,
        #[serde(rename = "val")]
        value: Option<Value>,
    },

    #[serde(rename = "store_value")]
    StoreValue {},

    #[serde(rename = "find_peer")]
    FindPeer {
        #[serde(rename = "n4")]
        nodes4: Option<Vec<NodeInfo>>,
        #[serde(rename = "n6")]
        nodes6: Option<Vec<NodeInfo>>,
        #[serde(rename = "tok")]
        token: Option<u32>,
        #[serde(rename = "ps")]
        peers: Option<Vec<PeerInfo>>,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "c")]
    pub code: i32,
    #[serde(rename = "m")]
    pub message: String,
}

impl Message {
    pub fn request(txid: u32, sender: Id, request: Request) -> Self {
        Self {
            txid,
            version: crate::types::version::build(),
            sender,
            body: Body::Request(request),
        }
    }

    pub fn response(txid: u32, sender: Id, response: Response) -> Self {
        Self {
            txid,
            version: crate::types::version::build(),
            sender,
            body: Body::Response(response),
        }
    }

    pub fn error(txid: u32, sender: Id, code: ErrorCode) -> Self {
        Self {
            txid,
            version: crate::types::version::build(),
            sender,
            body: Body::Error(WireError {
                code: code.as_i32(),
                message: code.message().to_string(),
            }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            Body::Request(_) => MessageKind::Request,
            Body::Response(_) => MessageKind::Response,
            Body::Error(_) => MessageKind::Error,
        }
    }

    /// Method of the body; error bodies carry none.
    pub fn method(&self) -> Option<Method> {
        match &self.body {
            Body::Request(q) => Some(q.method()),
            Body::Response(r) => Some(r.method()),
            Body::Error(_) => None,
        }
    }
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Ping {} => Method::Ping,
            Request::FindNode { .. } => Method::FindNode,
            Request::FindValue { .. } => Method::FindValue,
            Request::StoreValue { .. } => Method::StoreValue,
            Request::FindPeer { .. } => Method::FindPeer,
            Request::AnnouncePeer { .. } => Method::AnnouncePeer,
        }
    }
}

impl Response {
    pub fn method(&self) -> Method {
        match self {
            Response::Ping {} => Method::Ping,
            Response::FindNode { .. } => Method::FindNode,
            Response::FindValue { .. } => Method::FindValue,
            Response::StoreValue {} => Method::StoreValue,
            Response::FindPeer { .. } => Method::FindPeer,
            Response::AnnouncePeer {} => Method::AnnouncePeer,
        }
    }

    /// Node hints carried by this response, both families chained.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        let (n4, n6) = match self {
            Response::FindNode { nodes4, nodes6, .. }
            | Response::FindValue { nodes4, nodes6, .. }
            | Response::FindPeer { nodes4, nodes6, .. } => (nodes4.as_ref(), nodes6.as_ref()),
            _ => (None, None),
        };
        n4.into_iter().flatten().chain(n6.into_iter().flatten())
    }

    pub fn token(&self) -> Option<u32> {
        match self {
            Response::FindNode { token, .. }
            | Response::FindValue { token, .. }
            | Response::FindPeer { token, .. } => *token,
            _ => None,
        }
    }
}

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| Error::Protocol(format!("encode: {}", e)))?;
    if buf.len() > MTU {
        return Err(Error::MessageTooBig(buf.len()));
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.len() > MTU {
        return Err(Error::MessageTooBig(bytes.len()));
    }
    let message: Message = ciborium::from_reader(bytes)
        .map_err(|e| Error::Protocol(format!("decode: {}", e)))?;
    check_bounds(&message)?;
    Ok(message)
}

/// Collection caps on decoded bodies; byte-level allocation is already
/// bounded by the MTU.
fn check_bounds(message: &Message) -> Result<()> {
    if let Body::Response(response) = &message.body {
        let (n4, n6) = match response {
            Response::FindNode { nodes4, nodes6, .. }
            | Response::FindValue { nodes4, nodes6, .. }
            | Response::FindPeer { nodes4, nodes6, .. } => (nodes4, nodes6),
            _ => (&None, &None),
        };
        for nodes in [n4, n6].into_iter().flatten() {
            if nodes.len() > MAX_NODES_PER_RESPONSE {
                return Err(Error::Protocol(format!(
                    "too many node hints: {}",
                    nodes.len()
                )));
            }
        }
        if let Response::FindPeer {
            peers: Some(peers), ..
        } = response
        {
            if peers.len() > MAX_PEERS_PER_RESPONSE {
                return Err(Error::Protocol(format!("too many peers: {}", peers.len())));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    fn sample_messages() -> Vec<Message> {
        let identity = Identity::generate();
        let sender = *identity.id();
        let target = Id::random();
        let value = Value::signed(&identity, None, 4, b"codec".to_vec()).unwrap();
        let peer = PeerInfo::new(&identity, Id::random(), None, 8080, None).unwrap();
        let node4 = NodeInfo::new(Id::random(), "5.6.7.8:1234".parse().unwrap());
        let node6 = NodeInfo::new(Id::random(), "[2001:db8::1]:1234".parse().unwrap());

        vec![
            Message::request(1, sender, Request::Ping {}),
            Message::response(1, sender, Response::Ping {}),
            Message::request(
                2,
                sender,
                Request::FindNode {
                    target,
                    want4: true,
                    want6: false,
                    want_token: true,
                },
            ),
            Message::response(
                2,
                sender,
                Response::FindNode {
                    nodes4: Some(vec![node4.clone()]),
                    nodes6: Some(vec![node6.clone()]),
                    token: Some(0xdead_beef),
                },
            ),
            Message::request(
                3,
                sender,
                Request::FindValue {
                    target,
                    want4: true,
                    want6: true,
                    want_token: false,
                    expected_seq: Some(3),
                },
            ),
            Message::response(
                3,
                sender,
                Response::FindValue {
                    nodes4: Some(vec![node4.clone()]),
                    nodes6: None,
                    token: None,
                    value: Some(value.clone()),
                },
            ),
            Message::request(
                4,
                sender,
                Request::StoreValue {
                    token: 77,
                    value,
                    expected_seq: None,
                },
            ),
            Message::response(4, sender, Response::StoreValue {}),
            Message::request(
                5,
                sender,
                Request::FindPeer {
                    target,
                    want4: false,
                    want6: true,
                    want_token: false,
                },
            ),
            Message::response(
                5,
                sender,
                Response::FindPeer {
                    nodes4: None,
                    nodes6: Some(vec![node6]),
                    token: None,
                    peers: Some(vec![peer.clone()]),
                },
            ),
            Message::request(6, sender, Request::AnnouncePeer { token: 9, peer }),
            Message::response(6, sender, Response::AnnouncePeer {}),
            Message::error(7, sender, ErrorCode::SequenceNotMonotonic),
        ]
    }

    #[test]
    fn encoding_is_bijective_over_the_grammar() {
        for message in sample_messages() {
            let bytes = encode(&message).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, message);
            let re_encoded = encode(&decoded).unwrap();
            assert_eq!(re_encoded, bytes, "re-encode of {:?}", message.method());
        }
    }

    #[test]
    fn kind_and_method_accessors() {
        let identity = Identity::generate();
        let msg = Message::request(1, *identity.id(), Request::Ping {});
        assert_eq!(msg.kind(), MessageKind::Request);
        assert_eq!(msg.method(), Some(Method::Ping));

        let msg = Message::error(1, *identity.id(), ErrorCode::MethodUnknown);
        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.method(), None);
    }

    #[test]
    fn oversize_datagram_rejected_on_both_sides() {
        let identity = Identity::generate();
        let value = Value::immutable(vec![0xab; crate::value::MAX_VALUE_DATA]).unwrap();
        let msg = Message::request(
            1,
            *identity.id(),
            Request::StoreValue {
                token: 1,
                value,
                expected_seq: None,
            },
        );
        // 1200 bytes of data fits the 1400-byte MTU
        assert!(encode(&msg).is_ok());

        let big = vec![0u8; MTU + 1];
        assert!(matches!(decode(&big), Err(Error::MessageTooBig(_))));
    }

    #[test]
    fn unknown_envelope_field_rejected() {
        use ciborium::Value as Cbor;
        let id_bytes = Id::random().as_bytes().to_vec();
        let map = Cbor::Map(vec![
            (Cbor::Text("t".into()), Cbor::Integer(1.into())),
            (Cbor::Text("v".into()), Cbor::Integer(1.into())),
            (Cbor::Text("id".into()), Cbor::Bytes(id_bytes)),
            (
                Cbor::Text("q".into()),
                Cbor::Map(vec![(Cbor::Text("ping".into()), Cbor::Map(vec![]))]),
            ),
            (Cbor::Text("zz".into()), Cbor::Integer(42.into())),
        ]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&map, &mut bytes).unwrap();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn truncated_and_garbage_input_rejected() {
        let identity = Identity::generate();
        let bytes = encode(&Message::request(9, *identity.id(), Request::Ping {})).unwrap();
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode(&[0xff, 0x00, 0x12]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn node_hint_flood_rejected() {
        let identity = Identity::generate();
        let nodes: Vec<NodeInfo> = (0..MAX_NODES_PER_RESPONSE + 1)
            .map(|i| {
                NodeInfo::new(
                    Id::random(),
                    format!("1.1.1.1:{}", 1000 + i).parse().unwrap(),
                )
            })
            .collect();
        let msg = Message::response(
            1,
            *identity.id(),
            Response::FindNode {
                nodes4: Some(nodes),
                nodes6: None,
                token: None,
            },
        );
        let bytes = encode(&msg).unwrap();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn version_word_travels() {
        let identity = Identity::generate();
        let msg = Message::request(1, *identity.id(), Request::Ping {});
        let decoded = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(
            crate::types::version::readable(decoded.version),
            "MR/1"
        );
    }
}
