//! fault-detection: liveness monitoring for cluster members.
//!
//! This crate provides:
//! - Per-node ping sessions with a bounded retry budget
//! - Reconciliation of the monitored set against a membership snapshot
//! - Disconnect handling with optional verified reconnect
//! - Asynchronous fan-out of failure and ping-received events
//! - Validation of inbound pings
//!
//! The network is abstracted behind [`PingTransport`].

pub mod config;
pub mod detector;
pub mod listeners;
pub mod messages;
pub mod node;
mod session;
pub mod transport;

pub use config::{ConfigError, FaultDetectionConfig};
pub use detector::{DetectorError, NodesFaultDetector};
pub use listeners::{FaultEvent, FaultListener, ListenerId};
pub use messages::{PingRejection, PingRequest, PingResponse};
pub use node::{ClusterName, DiscoveryNode, NodeId, NodeIdError, UNKNOWN_STATE_VERSION};
pub use transport::{PingTransport, TransportError};
