//! Peer identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Identity of a remote peer: node id plus the address and port of its
/// chunk-serving transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    /// The peer's overlay identity.
    pub node_id: NodeId,
    /// Host address (IP or hostname).
    pub address: String,
    /// Serving port.
    pub port: u16,
}

impl PeerHandle {
    /// Creates a new peer handle.
    pub fn new(node_id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            address: address.into(),
            port,
        }
    }

    /// Returns the `address:port` form suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let peer = PeerHandle::new(NodeId::random(), "127.0.0.1", 9000);
        assert_eq!(peer.endpoint(), "127.0.0.1:9000");
    }

    #[test]
    fn test_json_roundtrip() {
        let peer = PeerHandle::new(NodeId::random(), "localhost", 8468);
        let json = serde_json::to_string(&peer).unwrap();
        let back: PeerHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(peer, back);
    }
}
