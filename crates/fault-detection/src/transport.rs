//! Transport contract consumed by fault detection.
//!
//! The detector never talks to the network directly. Implementations:
//! - `fd-daemon`: WebSocket connections, one per remote node
//! - tests: scripted in-memory transports

use crate::messages::{PingRequest, PingResponse};
use crate::node::DiscoveryNode;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection to the node is gone. Not retried by the ping session;
    /// handed to the disconnect handler instead.
    #[error("Connection lost: {0}")]
    ConnectLost(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The remote node answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_connect_lost(&self) -> bool {
        matches!(self, TransportError::ConnectLost(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Request/response transport used to ping remote nodes.
#[async_trait]
pub trait PingTransport: Send + Sync + 'static {
    /// Send a ping and wait for the response, for at most `timeout`.
    async fn send_ping(
        &self,
        target: &DiscoveryNode,
        request: PingRequest,
        timeout: Duration,
    ) -> Result<PingResponse>;

    /// Open (or verify) a connection to the node.
    async fn connect(&self, target: &DiscoveryNode) -> Result<()>;
}
