//! Cluster membership as seen by this daemon.
//!
//! Members are keyed by address: a node restarting at the same address
//! replaces its previous identity. Every change bumps the version reported
//! in outgoing pings.

use fault_detection::{DiscoveryNode, FaultListener};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct MembershipView {
    members: RwLock<HashMap<String, DiscoveryNode>>,
    version: AtomicI64,
}

impl MembershipView {
    /// A view containing only the local node, at version 1.
    pub fn new(local: DiscoveryNode) -> Arc<Self> {
        let mut members = HashMap::new();
        members.insert(local.address.clone(), local);
        Arc::new(Self {
            members: RwLock::new(members),
            version: AtomicI64::new(1),
        })
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn members(&self) -> Vec<DiscoveryNode> {
        self.read().values().cloned().collect()
    }

    pub fn contains_address(&self, address: &str) -> bool {
        self.read().contains_key(address)
    }

    /// Add or replace the member at `node.address`. Returns true if the view changed.
    pub fn add(&self, node: DiscoveryNode) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if members.get(&node.address) == Some(&node) {
            return false;
        }
        if let Some(previous) = members.insert(node.address.clone(), node) {
            info!("Replaced member {} at {}", previous, previous.address);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Remove `node` if it is the current member at its address.
    pub fn remove(&self, node: &DiscoveryNode) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if members.get(&node.address) != Some(node) {
            return false;
        }
        members.remove(&node.address);
        self.version.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DiscoveryNode>> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes failed nodes from the view and reports each removal on a channel
/// so the owner can reconcile the detector.
pub struct RemoveFailedNodes {
    view: Arc<MembershipView>,
    removed_tx: mpsc::UnboundedSender<DiscoveryNode>,
}

impl RemoveFailedNodes {
    pub fn new(view: Arc<MembershipView>) -> (Arc<Self>, mpsc::UnboundedReceiver<DiscoveryNode>) {
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { view, removed_tx }), removed_rx)
    }
}

impl FaultListener for RemoveFailedNodes {
    fn on_node_failure(&self, node: &DiscoveryNode, reason: &str) {
        warn!("Node {} failed: {}", node, reason);
        if self.view.remove(node) {
            let _ = self.removed_tx.send(node.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fault_detection::NodeId;

    fn node(n: u64, port: u16) -> DiscoveryNode {
        DiscoveryNode::new(
            format!("node-{}", n),
            NodeId::new(n.into()),
            format!("127.0.0.1:{}", port),
        )
    }

    #[test]
    fn test_add_bumps_version_once() {
        let view = MembershipView::new(node(1, 9301));
        assert_eq!(view.version(), 1);

        let peer = node(2, 9302);
        assert!(view.add(peer.clone()));
        assert!(!view.add(peer.clone()));

        assert_eq!(view.version(), 2);
        assert_eq!(view.members().len(), 2);
        assert!(view.members().contains(&peer));
    }

    #[test]
    fn test_restarted_node_replaces_previous_identity() {
        let view = MembershipView::new(node(1, 9301));
        let peer = node(2, 9302);
        let restarted = peer.restarted();

        view.add(peer.clone());
        assert!(view.add(restarted.clone()));

        assert!(!view.members().contains(&peer));
        assert!(view.members().contains(&restarted));
        assert_eq!(view.members().len(), 2);

        // a late failure report for the old identity leaves the new one alone
        assert!(!view.remove(&peer));
        assert!(view.contains_address("127.0.0.1:9302"));
    }

    #[tokio::test]
    async fn test_failure_listener_removes_member() {
        let view = MembershipView::new(node(1, 9301));
        let peer = node(2, 9302);
        view.add(peer.clone());
        let (listener, mut removed) = RemoveFailedNodes::new(Arc::clone(&view));

        listener.on_node_failure(&peer, "failed to ping");
        listener.on_node_failure(&peer, "failed to ping");

        assert_eq!(removed.recv().await, Some(peer.clone()));
        assert!(removed.try_recv().is_err());
        assert!(!view.contains_address(&peer.address));
        assert_eq!(view.version(), 3);
    }
}
