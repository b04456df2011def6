//! Wire protocol messages.
//!
//! Every frame is JSON sent as a binary WebSocket message (UTF-8 bytes).
//! Each side opens with a `handshake` carrying its full node identity.

use fault_detection::{DiscoveryNode, PingRejection, PingRequest, PingResponse};
use serde::{Deserialize, Serialize};

/// Maximum frame size (1MB). Ping traffic is tiny; anything larger is dropped.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// First frame on every connection, in both directions.
    Handshake { node: DiscoveryNode },

    PingRequest {
        #[serde(rename = "requestId")]
        request_id: u64,
        request: PingRequest,
    },

    PingResponse {
        #[serde(rename = "requestId")]
        request_id: u64,
        response: PingResponse,
    },

    /// The remote refused the ping.
    PingError {
        #[serde(rename = "requestId")]
        request_id: u64,
        rejection: PingRejection,
    },
}

impl WireMessage {
    /// Serialize to UTF-8 JSON bytes for sending as a binary WebSocket frame.
    pub fn to_binary(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Try to parse a frame. Returns None for oversized or malformed data.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        serde_json::from_slice(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fault_detection::{ClusterName, NodeId};

    fn node(n: u64) -> DiscoveryNode {
        DiscoveryNode::new(format!("node-{}", n), NodeId::new(n.into()), format!("127.0.0.1:{}", n))
    }

    #[test]
    fn test_handshake_json_shape() {
        let msg = WireMessage::Handshake { node: node(1) };
        let text = String::from_utf8(msg.to_binary().unwrap()).unwrap();

        assert!(text.starts_with("{\"type\":\"handshake\""));
        assert_eq!(WireMessage::from_binary(text.as_bytes()), Some(msg));
    }

    #[test]
    fn test_ping_request_frame() {
        let msg = WireMessage::PingRequest {
            request_id: 9,
            request: PingRequest {
                target_node: node(2),
                cluster_name: ClusterName::new("prod"),
                requester: node(1),
                cluster_state_version: 3,
            },
        };
        let text = String::from_utf8(msg.to_binary().unwrap()).unwrap();

        assert!(text.contains("\"type\":\"pingRequest\""));
        assert!(text.contains("\"requestId\":9"));
        assert_eq!(WireMessage::from_binary(text.as_bytes()), Some(msg));
    }

    #[test]
    fn test_ping_error_carries_rejection() {
        let msg = WireMessage::PingError {
            request_id: 4,
            rejection: PingRejection::WrongCluster {
                received: "a".into(),
                local: "b".into(),
            },
        };
        let parsed = WireMessage::from_binary(&msg.to_binary().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_invalid_frames_return_none() {
        assert!(WireMessage::from_binary(b"not json at all").is_none());
        assert!(WireMessage::from_binary(b"{\"type\": \"other\"}").is_none());
        assert!(WireMessage::from_binary(&vec![b' '; MAX_MESSAGE_SIZE + 1]).is_none());
    }
}
