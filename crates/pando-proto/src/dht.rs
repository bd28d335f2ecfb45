//! DHT datagram protocol.
//!
//! Each overlay RPC travels as one UDP datagram holding a JSON object
//! `{ "txn": u64, "type": str, "payload": { ... } }`. Responses echo the
//! transaction id of their request; unrelated RPCs carry no ordering
//! guarantees. Every payload names its sender so the receiver can refresh
//! its routing table.

use serde::{Deserialize, Serialize};

use pando_core::{NodeId, PeerHandle};

use crate::{MAX_DATAGRAM_LEN, MAX_NODES_PER_DATAGRAM};

/// Transaction id matching a response to its request.
pub type TxnId = u64;

/// One overlay datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datagram {
    /// Transaction id; responses echo the request's.
    pub txn: TxnId,
    /// The typed body, serialized as the `type` and `payload` fields.
    #[serde(flatten)]
    pub body: DatagramBody,
}

impl Datagram {
    /// Creates a datagram.
    pub fn new(txn: TxnId, body: DatagramBody) -> Self {
        Self { txn, body }
    }

    /// Serializes to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses from the JSON wire form.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Returns true if this datagram is a response body.
    pub fn is_response(&self) -> bool {
        matches!(
            self.body,
            DatagramBody::Pong { .. }
                | DatagramBody::Nodes { .. }
                | DatagramBody::Value { .. }
                | DatagramBody::Ack { .. }
        )
    }

    /// Returns the sender handle embedded in the payload.
    pub fn sender(&self) -> &PeerHandle {
        match &self.body {
            DatagramBody::Ping { sender }
            | DatagramBody::Pong { sender }
            | DatagramBody::FindNode { sender, .. }
            | DatagramBody::Nodes { sender, .. }
            | DatagramBody::FindValue { sender, .. }
            | DatagramBody::Value { sender, .. }
            | DatagramBody::Store { sender, .. }
            | DatagramBody::Ack { sender } => sender,
        }
    }
}

/// Typed datagram bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DatagramBody {
    /// Liveness probe.
    #[serde(rename = "PING")]
    Ping {
        /// The probing peer.
        sender: PeerHandle,
    },

    /// Liveness reply.
    #[serde(rename = "PONG")]
    Pong {
        /// The responding peer.
        sender: PeerHandle,
    },

    /// Request for the peers nearest to `target`.
    #[serde(rename = "FIND_NODE")]
    FindNode {
        /// The requesting peer.
        sender: PeerHandle,
        /// Keyspace point to search around.
        target: NodeId,
    },

    /// Nearest-peer response to `FIND_NODE` or `FIND_VALUE`.
    #[serde(rename = "NODES")]
    Nodes {
        /// The responding peer.
        sender: PeerHandle,
        /// Up to K peers nearest the target.
        nodes: Vec<PeerHandle>,
    },

    /// Request for a stored value.
    #[serde(rename = "FIND_VALUE")]
    FindValue {
        /// The requesting peer.
        sender: PeerHandle,
        /// Textual key form, e.g. `chunk:<digest-hex>`.
        key: String,
    },

    /// Value hit response to `FIND_VALUE`.
    #[serde(rename = "VALUE")]
    Value {
        /// The responding peer.
        sender: PeerHandle,
        /// The key the value is stored under.
        key: String,
        /// The stored value.
        value: serde_json::Value,
    },

    /// Request to store a key/value pair.
    #[serde(rename = "STORE")]
    Store {
        /// The publishing peer.
        sender: PeerHandle,
        /// Textual key form.
        key: String,
        /// Value to store.
        value: serde_json::Value,
        /// Seconds until the responder may expire the value.
        ttl_secs: u64,
    },

    /// Acknowledgement of a `STORE`.
    #[serde(rename = "ACK")]
    Ack {
        /// The responding peer.
        sender: PeerHandle,
    },
}

/// Splits a node list into slices that each fit a datagram.
///
/// Application-layer fragmentation for `NODES` responses whose encoded form
/// would exceed the UDP payload budget; each fragment is sent as its own
/// datagram with the same transaction id.
pub fn fragment_nodes(nodes: &[PeerHandle]) -> Vec<Vec<PeerHandle>> {
    if nodes.is_empty() {
        return vec![Vec::new()];
    }
    nodes
        .chunks(MAX_NODES_PER_DATAGRAM)
        .map(|c| c.to_vec())
        .collect()
}

/// Returns true if the encoded datagram fits a single UDP payload.
pub fn fits_datagram(d: &Datagram) -> bool {
    d.to_bytes().map(|b| b.len() <= MAX_DATAGRAM_LEN).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(port: u16) -> PeerHandle {
        PeerHandle::new(NodeId::random(), "127.0.0.1", port)
    }

    #[test]
    fn test_wire_shape() {
        let d = Datagram::new(
            42,
            DatagramBody::FindNode {
                sender: handle(8468),
                target: NodeId::random(),
            },
        );
        let json: serde_json::Value = serde_json::from_slice(&d.to_bytes().unwrap()).unwrap();
        assert_eq!(json["txn"], 42);
        assert_eq!(json["type"], "FIND_NODE");
        assert!(json["payload"]["target"].is_string());
        assert!(json["payload"]["sender"]["node_id"].is_string());
    }

    #[test]
    fn test_roundtrip_all_types() {
        let s = handle(1);
        let bodies = vec![
            DatagramBody::Ping { sender: s.clone() },
            DatagramBody::Pong { sender: s.clone() },
            DatagramBody::FindNode {
                sender: s.clone(),
                target: NodeId::random(),
            },
            DatagramBody::Nodes {
                sender: s.clone(),
                nodes: vec![handle(2), handle(3)],
            },
            DatagramBody::FindValue {
                sender: s.clone(),
                key: "chunk:00ff".to_string(),
            },
            DatagramBody::Value {
                sender: s.clone(),
                key: "chunk:00ff".to_string(),
                value: serde_json::json!([{"port": 9000}]),
            },
            DatagramBody::Store {
                sender: s.clone(),
                key: "file:abcd".to_string(),
                value: serde_json::json!({"size": 10}),
                ttl_secs: 3600,
            },
            DatagramBody::Ack { sender: s },
        ];
        for (i, body) in bodies.into_iter().enumerate() {
            let d = Datagram::new(i as u64, body);
            let back = Datagram::from_slice(&d.to_bytes().unwrap()).unwrap();
            assert_eq!(d, back);
        }
    }

    #[test]
    fn test_is_response() {
        let s = handle(1);
        assert!(!Datagram::new(1, DatagramBody::Ping { sender: s.clone() }).is_response());
        assert!(Datagram::new(1, DatagramBody::Ack { sender: s }).is_response());
    }

    #[test]
    fn test_extra_fields_ignored() {
        let raw = serde_json::json!({
            "txn": 7,
            "type": "PING",
            "payload": {
                "sender": {"node_id": NodeId::random().to_hex(), "address": "h", "port": 1},
                "future": true
            },
            "trailer": "ignored"
        });
        let d: Datagram = serde_json::from_value(raw).unwrap();
        assert_eq!(d.txn, 7);
        assert!(matches!(d.body, DatagramBody::Ping { .. }));
    }

    #[test]
    fn test_fragment_nodes() {
        let nodes: Vec<PeerHandle> = (0..70).map(|i| handle(i)).collect();
        let frags = fragment_nodes(&nodes);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags.iter().map(Vec::len).sum::<usize>(), 70);
        assert!(frags.iter().all(|f| f.len() <= MAX_NODES_PER_DATAGRAM));

        assert_eq!(fragment_nodes(&[]).len(), 1);
    }

    #[test]
    fn test_fits_datagram() {
        let d = Datagram::new(
            1,
            DatagramBody::Nodes {
                sender: handle(1),
                nodes: (0..MAX_NODES_PER_DATAGRAM as u16).map(handle).collect(),
            },
        );
        assert!(fits_datagram(&d));
    }
}
