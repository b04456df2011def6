//! Daemon wiring: server, transport, membership view and detector.

use crate::config::DaemonConfig;
use crate::connection::TransportEvent;
use crate::membership::{MembershipView, RemoveFailedNodes};
use crate::server::PingServer;
use crate::transport::WsTransport;
use anyhow::{Context, Result};
use fault_detection::{ClusterName, DiscoveryNode, NodeId, NodesFaultDetector};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A running node: answers pings, discovers seeds, and monitors members.
pub struct Daemon {
    config: DaemonConfig,
    detector: NodesFaultDetector,
    transport: Arc<WsTransport>,
    view: Arc<MembershipView>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    removed_nodes: mpsc::UnboundedReceiver<DiscoveryNode>,
    server_task: JoinHandle<()>,
}

impl Daemon {
    /// Bind the server and build the detector. Must run inside a Tokio runtime.
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        let server = PingServer::bind(&config.listen).await?;

        let node_id = config.node_id.unwrap_or_else(|| {
            let id = NodeId::generate();
            info!("Generated node ID: {}", id);
            id
        });
        let address = config
            .advertised_address
            .clone()
            .unwrap_or_else(|| server.local_addr().to_string());
        let local = DiscoveryNode::new(config.node_name.clone(), node_id, address);
        info!("Local node: {}", local);

        let (transport, transport_events) = WsTransport::new(local.clone());
        let view = MembershipView::new(local.clone());

        let state_view = Arc::clone(&view);
        let detector = NodesFaultDetector::new(
            config.fault_detection.clone(),
            ClusterName::new(config.cluster_name.clone()),
            local,
            transport.clone(),
            move || state_view.version(),
        )
        .context("Failed to start fault detection")?;

        let (remover, removed_nodes) = RemoveFailedNodes::new(Arc::clone(&view));
        detector.add_listener(remover);

        let server_task = tokio::spawn(server.serve(detector.clone()));

        Ok(Self {
            config,
            detector,
            transport,
            view,
            transport_events,
            removed_nodes,
            server_task,
        })
    }

    pub fn local_node(&self) -> DiscoveryNode {
        self.detector.local_node()
    }

    pub fn detector(&self) -> &NodesFaultDetector {
        &self.detector
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    /// Dial every seed not already in the view, then bring the detector in
    /// line with the view.
    pub async fn discover(&self) {
        let local = self.local_node();
        for seed in &self.config.seeds {
            if *seed == local.address || self.view.contains_address(seed) {
                continue;
            }
            match self.transport.connect_to_address(seed).await {
                Ok(node) => {
                    if self.view.add(node.clone()) {
                        info!("Discovered {} at {}", node, seed);
                    }
                }
                Err(e) => debug!("Seed {} unreachable: {}", seed, e),
            }
        }
        self.detector.reconcile(&self.view.members());
    }

    /// Run the event loop until `shutdown` resolves, then stop.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut discovery = tokio::time::interval(self.config.discovery_interval());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = discovery.tick() => {
                    self.discover().await;
                }

                Some(event) = self.transport_events.recv() => {
                    self.on_transport_event(event).await;
                }

                Some(node) = self.removed_nodes.recv() => {
                    info!("Removed {} from membership (version {})", node, self.view.version());
                    self.transport.disconnect(&node).await;
                    self.detector.reconcile(&self.view.members());
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected(node) => {
                // a replacement connection means the disconnect was already handled
                if self.transport.remove_closed(&node) {
                    info!("Disconnected from {}", node);
                    self.detector.on_transport_disconnected(&node).await;
                }
            }
        }
    }

    /// Stop the detector and wait for the server to release its socket.
    async fn shutdown(&mut self) {
        info!("Shutting down");
        self.detector.stop();
        self.server_task.abort();
        let _ = (&mut self.server_task).await;
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
