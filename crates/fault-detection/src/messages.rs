//! Ping protocol messages.
//!
//! Serialized as camelCase JSON so any transport can ship them verbatim.

use crate::node::{ClusterName, DiscoveryNode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A liveness probe sent to a monitored node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    /// The node we believe we are pinging
    pub target_node: DiscoveryNode,
    /// Cluster the requester belongs to
    pub cluster_name: ClusterName,
    /// The node sending the ping
    pub requester: DiscoveryNode,
    /// Requester's last known membership version
    pub cluster_state_version: i64,
}

/// Acknowledgement of a [`PingRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {}

/// Why an inbound ping was refused.
///
/// Both cases point at misconfiguration or a restarted process answering on
/// a reused address, so they are returned to the caller rather than ignored.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum PingRejection {
    #[error("got pinged as node [{target}], but I am node [{local}]")]
    WrongNode { target: String, local: String },

    #[error("got pinged with cluster name [{received}], but I'm part of cluster [{local}]")]
    WrongCluster { received: String, local: String },
}
