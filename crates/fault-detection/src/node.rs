//! Node identity types.
//!
//! A [`DiscoveryNode`] is the monitoring key of the fault detector. It carries
//! both a persistent [`NodeId`] and an ephemeral one that is regenerated every
//! time the process starts, so a process restarted on the same address is a
//! different node.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Membership version sent when the requester has no known cluster state.
pub const UNKNOWN_STATE_VERSION: i64 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("node id must be {expected} hex characters, got {found}")]
    Length { expected: usize, found: usize },
    #[error("node id has non-hex character {found:?} at position {position}")]
    NotHex { position: usize, found: char },
}

/// Persistent identifier of a node: 128 random bits, written as 32 lowercase
/// hex characters.
///
/// # Examples
/// ```
/// use fault_detection::NodeId;
///
/// let id: NodeId = "000000000000000000000000000000ff".parse().unwrap();
/// assert_eq!(id, NodeId::new(0xff));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u128);

impl NodeId {
    const TEXT_LEN: usize = 32;

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// A fresh random id for a node that has none configured.
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let found = s.chars().count();
        if found != Self::TEXT_LEN {
            return Err(NodeIdError::Length {
                expected: Self::TEXT_LEN,
                found,
            });
        }
        s.chars().enumerate().try_fold(Self(0), |id, (position, c)| {
            let digit = c
                .to_digit(16)
                .ok_or(NodeIdError::NotHex { position, found: c })?;
            Ok(Self(id.0 << 4 | u128::from(digit)))
        })
    }
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A cluster member as seen by fault detection.
///
/// Equality covers every field. Two processes started one after the other on
/// the same address share `id` and `address` but never `ephemeral_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryNode {
    /// Human-readable node name
    pub name: String,
    /// Persistent node identifier
    pub id: NodeId,
    /// Identifier regenerated on every process start
    pub ephemeral_id: NodeId,
    /// Transport address (host:port)
    pub address: String,
}

impl DiscoveryNode {
    pub fn new(name: impl Into<String>, id: NodeId, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            ephemeral_id: NodeId::generate(),
            address: address.into(),
        }
    }

    /// The same node after a process restart: same name, id and address,
    /// fresh ephemeral id.
    pub fn restarted(&self) -> Self {
        Self {
            ephemeral_id: NodeId::generate(),
            ..self.clone()
        }
    }
}

impl Display for DiscoveryNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}}}{{{}}}{{{}}}{{{}}}",
            self.name, self.id, self.ephemeral_id, self.address
        )
    }
}

/// Name of the cluster a node belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(String);

impl ClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClusterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
