//! Overlay wire frames
//!
//! One tagged sum covers both transports: JSON datagrams on the routing
//! socket and newline-delimited JSON on the stream transport.
//! [`Frame::decode`] is the single decode point; unrecognized tags become
//! [`Frame::Unknown`] so dispatchers can drop them without surfacing an
//! error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WireError;
use crate::types::NodeId;

/// One encrypted onion layer as carried on the wire.
///
/// The ciphertext decrypts (for exactly one relay) to either a forwarding
/// record holding the next layer, or a terminal delivery record. The tag is
/// random padding at the outermost layer and indistinguishable from the
/// tags of interior layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionLayer {
    /// Sealed box, base64
    pub ciphertext: String,
    /// 128-bit random tag, hex
    pub next_hop_tag: String,
}

/// Contact record carried in NODES and PEER_DISCOVERY frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContact {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    /// "host:port" of the peer's datagram socket
    pub address: String,
}

const KNOWN_TAGS: &[&str] = &[
    "PING",
    "PONG",
    "STORE",
    "FIND_VALUE",
    "FOUND",
    "NODES",
    "NAT_PUNCH",
    "NAT_PUNCH_ACK",
    "ONION_PACKET",
    "DHT_QUERY",
    "PEER_DISCOVERY",
    "ANONYMOUS_MESSAGE",
    "DUMMY_TRAFFIC",
];

/// Every frame of both wire protocols.
///
/// Datagram frames (PING through NAT_PUNCH_ACK) always carry the sender's
/// `nodeId`; stream frames do not identify their sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Ping {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    Pong {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    Store {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        key: NodeId,
        value: Value,
    },
    FindValue {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        key: NodeId,
        #[serde(rename = "queryId")]
        query_id: Uuid,
    },
    Found {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        key: NodeId,
        value: Value,
        #[serde(rename = "queryId")]
        query_id: Uuid,
    },
    Nodes {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        key: NodeId,
        nodes: Vec<WireContact>,
        #[serde(rename = "queryId")]
        query_id: Uuid,
    },
    NatPunch {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        timestamp: u64,
    },
    NatPunchAck {
        #[serde(rename = "nodeId")]
        node_id: NodeId,
    },
    OnionPacket {
        packet: OnionLayer,
        #[serde(rename = "circuitId")]
        circuit_id: Uuid,
    },
    DhtQuery {
        key: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    PeerDiscovery {
        contacts: Vec<WireContact>,
    },
    AnonymousMessage {
        payload: Value,
    },
    DummyTraffic {
        data: String,
        timestamp: u64,
    },
    /// Unrecognized tag; never sent, dropped on receipt
    #[serde(skip)]
    Unknown,
}

impl Frame {
    /// Decode one frame of either transport.
    ///
    /// A known tag with a schema mismatch (or unparseable JSON, or a
    /// missing tag) is an error; callers drop those silently per the
    /// protocol. An unknown tag decodes to [`Frame::Unknown`].
    pub fn decode(text: &str) -> Result<Frame, WireError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| WireError::Malformed("missing type tag".into()))?;
        if !KNOWN_TAGS.contains(&tag) {
            return Ok(Frame::Unknown);
        }
        serde_json::from_value(value).map_err(|e| WireError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Sender id carried by datagram frames; stream frames have none
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            Frame::Ping { node_id }
            | Frame::Pong { node_id }
            | Frame::Store { node_id, .. }
            | Frame::FindValue { node_id, .. }
            | Frame::Found { node_id, .. }
            | Frame::Nodes { node_id, .. }
            | Frame::NatPunch { node_id, .. }
            | Frame::NatPunchAck { node_id } => Some(*node_id),
            _ => None,
        }
    }
}
