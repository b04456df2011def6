//! WebSocket implementation of [`PingTransport`].

use crate::connection::{NodeConnection, TransportEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use fault_detection::{DiscoveryNode, PingRequest, PingResponse, PingTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Holds one outgoing connection per node identity.
pub struct WsTransport {
    local: DiscoveryNode,
    connections: DashMap<DiscoveryNode, Arc<NodeConnection>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl WsTransport {
    /// Create a transport and the receiver for its connection events.
    pub fn new(local: DiscoveryNode) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local,
            connections: DashMap::new(),
            event_tx,
        });
        (transport, event_rx)
    }

    /// Dial an address whose identity is not known yet (discovery).
    ///
    /// Returns the node that answered the handshake.
    pub async fn connect_to_address(&self, address: &str) -> Result<DiscoveryNode, TransportError> {
        let conn = NodeConnection::open(address, &self.local, self.event_tx.clone()).await?;
        let node = conn.remote().clone();
        if node == self.local {
            conn.close().await;
            return Err(TransportError::ConnectFailed(format!("{} is the local node", address)));
        }
        self.register(conn).await;
        Ok(node)
    }

    /// Drop the connection to `node`, if any.
    pub async fn disconnect(&self, node: &DiscoveryNode) {
        if let Some((_, conn)) = self.connections.remove(node) {
            debug!("Disconnecting from {}", node);
            conn.close().await;
        }
    }

    /// Forget the connection to `node` if its read side has ended.
    pub fn remove_closed(&self, node: &DiscoveryNode) -> bool {
        self.connections.remove_if(node, |_, c| c.is_closed()).is_some()
    }

    async fn register(&self, conn: NodeConnection) {
        let node = conn.remote().clone();
        info!("Connected to {}", node);
        if let Some(old) = self.connections.insert(node, Arc::new(conn)) {
            old.close().await;
        }
    }
}

#[async_trait]
impl PingTransport for WsTransport {
    async fn send_ping(
        &self,
        target: &DiscoveryNode,
        request: PingRequest,
        timeout: Duration,
    ) -> Result<PingResponse, TransportError> {
        let conn = self
            .connections
            .get(target)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| TransportError::ConnectLost(format!("not connected to {}", target)))?;
        conn.ping(request, timeout).await
    }

    /// Verified connect: the remote must answer the handshake as exactly `target`.
    async fn connect(&self, target: &DiscoveryNode) -> Result<(), TransportError> {
        let conn = NodeConnection::open(&target.address, &self.local, self.event_tx.clone()).await?;
        if conn.remote() != target {
            let found = conn.remote().clone();
            conn.close().await;
            return Err(TransportError::ConnectFailed(format!(
                "expected {} at {}, found {}",
                target, target.address, found
            )));
        }
        self.register(conn).await;
        Ok(())
    }
}
