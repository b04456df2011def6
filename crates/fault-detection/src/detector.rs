//! Fault detection across all cluster members.
//!
//! [`NodesFaultDetector`] keeps one ping session per monitored node in a
//! concurrent map. Every mutation of that map is a single atomic map
//! operation (`entry`, `remove_if`, `insert`, `retain`); no lock is held
//! across a network call.
//!
//! Typical wiring:
//! 1. Construct with a [`PingTransport`] and the local node
//! 2. Call [`NodesFaultDetector::reconcile`] whenever membership changes
//! 3. Route inbound pings to [`NodesFaultDetector::handle_ping_request`]
//! 4. Route transport disconnects to [`NodesFaultDetector::on_transport_disconnected`]

use crate::config::{ConfigError, FaultDetectionConfig};
use crate::listeners::{FaultEvent, FaultListener, ListenerId, ListenerRegistry};
use crate::messages::{PingRejection, PingRequest, PingResponse};
use crate::node::{ClusterName, DiscoveryNode};
use crate::session::PingSession;
use crate::transport::{self, PingTransport, TransportError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to start listener dispatch thread: {0}")]
    DispatchThread(#[from] std::io::Error),
}

/// Supplies the local node's current membership version.
pub type StateVersionFn = dyn Fn() -> i64 + Send + Sync;

pub(crate) struct Inner {
    config: FaultDetectionConfig,
    cluster_name: ClusterName,
    local_node: RwLock<DiscoveryNode>,
    transport: Arc<dyn PingTransport>,
    state_version: Box<StateVersionFn>,
    /// Monitored nodes and their live session
    sessions: DashMap<DiscoveryNode, Arc<PingSession>>,
    next_token: AtomicU64,
    listeners: ListenerRegistry,
    stopped: AtomicBool,
}

impl Inner {
    pub(crate) fn config(&self) -> &FaultDetectionConfig {
        &self.config
    }

    fn local_node(&self) -> DiscoveryNode {
        self.local_node
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// True if `session` is the one currently stored for its node.
    pub(crate) fn is_live(&self, session: &PingSession) -> bool {
        self.sessions
            .get(session.node())
            .is_some_and(|live| live.token() == session.token())
    }

    /// Remove the node only if it still maps to `session`.
    pub(crate) fn remove_session(&self, session: &PingSession) -> bool {
        self.sessions
            .remove_if(session.node(), |_, live| live.token() == session.token())
            .is_some()
    }

    fn new_session(&self, node: DiscoveryNode) -> Arc<PingSession> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        PingSession::new(node, token)
    }

    /// Run the session's first ping right away on the runtime.
    fn start_session(self: &Arc<Self>, session: Arc<PingSession>) {
        session.mark_started();
        tokio::spawn(session.run(Arc::clone(self)));
    }

    pub(crate) fn new_ping_request(&self, target: &DiscoveryNode) -> PingRequest {
        PingRequest {
            target_node: target.clone(),
            cluster_name: self.cluster_name.clone(),
            requester: self.local_node(),
            cluster_state_version: (self.state_version)(),
        }
    }

    /// Send one ping, bounded by `timeout` even if the transport ignores it.
    pub(crate) async fn send_ping(
        &self,
        target: &DiscoveryNode,
        request: PingRequest,
        timeout: Duration,
    ) -> transport::Result<PingResponse> {
        let attempt = self.transport.send_ping(target, request, timeout);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    pub(crate) fn notify_node_failure(&self, node: &DiscoveryNode, reason: String) {
        self.listeners.notify(FaultEvent::NodeFailed {
            node: node.clone(),
            reason,
        });
    }

    /// React to a lost connection: one verified reconnect if configured,
    /// otherwise report the node failed. A no-op for nodes not monitored.
    ///
    /// While reconnecting, the node maps to a session that is not started
    /// yet. It only starts if it is still mapped once `connect` returns, so a
    /// membership update or stop during the connect wins.
    pub(crate) async fn handle_transport_disconnect(self: &Arc<Self>, node: &DiscoveryNode) {
        if !self.config.connect_on_network_disconnect {
            let Some((_, previous)) = self.sessions.remove(node) else {
                return;
            };
            previous.cancel();
            trace!("{} transport disconnected", node);
            self.notify_node_failure(node, "transport disconnected".to_string());
            return;
        }

        let pending = self.new_session(node.clone());
        match self.sessions.entry(node.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_started() {
                    trace!("Already reconnecting to {}", node);
                    return;
                }
                entry.insert(Arc::clone(&pending)).cancel();
            }
            Entry::Vacant(_) => return,
        }

        match self.transport.connect(node).await {
            Ok(()) => {
                if self.is_stopped() || !self.is_live(&pending) {
                    debug!("Reconnected to {}, but it is no longer monitored", node);
                    return;
                }
                debug!("Reconnected to {}, restarting fault detection", node);
                self.start_session(pending);
            }
            Err(err) => {
                trace!(
                    "{} transport disconnected (with verified connect): {}",
                    node, err
                );
                if self.remove_session(&pending) {
                    self.notify_node_failure(
                        node,
                        "transport disconnected (with verified connect)".to_string(),
                    );
                }
            }
        }
    }
}

/// Pings every known cluster member and reports the ones that stop answering.
///
/// Cheap to clone; all clones share state. Sessions keep running until
/// [`stop`](Self::stop) is called, even if every handle is dropped.
#[derive(Clone)]
pub struct NodesFaultDetector {
    inner: Arc<Inner>,
}

impl NodesFaultDetector {
    /// Create a detector. Must be called from within a Tokio runtime.
    ///
    /// `state_version` is read for every outgoing ping.
    pub fn new(
        config: FaultDetectionConfig,
        cluster_name: ClusterName,
        local_node: DiscoveryNode,
        transport: Arc<dyn PingTransport>,
        state_version: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        debug!(
            "Node fault detection: ping_interval [{:?}], ping_timeout [{:?}], retries [{}]",
            config.ping_interval, config.ping_timeout, config.ping_retry_count
        );

        let listeners = ListenerRegistry::new(config.notification_queue_capacity)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cluster_name,
                local_node: RwLock::new(local_node),
                transport,
                state_version: Box::new(state_version),
                sessions: DashMap::new(),
                next_token: AtomicU64::new(1),
                listeners,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &FaultDetectionConfig {
        &self.inner.config
    }

    pub fn cluster_name(&self) -> &ClusterName {
        &self.inner.cluster_name
    }

    pub fn local_node(&self) -> DiscoveryNode {
        self.inner.local_node()
    }

    /// Replace the local node identity. Stops monitoring it if it was monitored.
    pub fn set_local_node(&self, node: DiscoveryNode) {
        if let Some((_, session)) = self.inner.sessions.remove(&node) {
            session.cancel();
        }
        *self
            .inner
            .local_node
            .write()
            .unwrap_or_else(|e| e.into_inner()) = node;
    }

    pub fn add_listener(&self, listener: Arc<dyn FaultListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Nodes currently monitored.
    pub fn nodes(&self) -> HashSet<DiscoveryNode> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Make sure exactly the given members are pinged.
    ///
    /// Nodes no longer present stop being pinged; new nodes get a session whose
    /// first ping runs immediately. Sessions for nodes still present are left
    /// alone. The local node is skipped. A no-op after [`stop`](Self::stop).
    pub fn reconcile<'a>(&self, members: impl IntoIterator<Item = &'a DiscoveryNode>) {
        if self.inner.is_stopped() {
            trace!("Ignoring membership update, fault detection is stopped");
            return;
        }

        let members: HashSet<&DiscoveryNode> = members.into_iter().collect();
        let local = self.inner.local_node();

        self.inner.sessions.retain(|node, session| {
            let keep = members.contains(node);
            if !keep {
                debug!("Stopping fault detection for {}, no longer a member", node);
                session.cancel();
            }
            keep
        });

        let mut started = Vec::new();
        for node in members {
            if *node == local {
                continue;
            }
            if let Entry::Vacant(entry) = self.inner.sessions.entry(node.clone()) {
                let session = self.inner.new_session(node.clone());
                entry.insert(Arc::clone(&session));
                started.push(session);
            }
        }

        if self.inner.is_stopped() {
            for session in started {
                self.inner.remove_session(&session);
                session.cancel();
            }
            return;
        }

        for session in started {
            debug!("Starting fault detection for {}", session.node());
            self.inner.start_session(session);
        }
    }

    /// Stop all pinging. Later calls to [`reconcile`](Self::reconcile) do nothing.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sessions.retain(|_, session| {
            session.cancel();
            false
        });
        debug!("Node fault detection stopped");
    }

    /// Handle a lost connection to `node`, whatever the configuration says
    /// about connection listeners.
    pub async fn handle_transport_disconnect(&self, node: &DiscoveryNode) {
        self.inner.handle_transport_disconnect(node).await;
    }

    /// Entry point for the transport's connection listener. Ignored unless
    /// `register_connection_listener` is set.
    pub async fn on_transport_disconnected(&self, node: &DiscoveryNode) {
        if self.inner.config.register_connection_listener {
            self.inner.handle_transport_disconnect(node).await;
        }
    }

    /// Validate and acknowledge a ping from a remote node.
    pub fn handle_ping_request(
        &self,
        request: PingRequest,
    ) -> Result<PingResponse, PingRejection> {
        let local = self.inner.local_node();

        // a restarted process on a reused address gets pinged as its predecessor
        if request.target_node != local {
            return Err(PingRejection::WrongNode {
                target: request.target_node.to_string(),
                local: local.to_string(),
            });
        }

        if request.cluster_name != self.inner.cluster_name {
            return Err(PingRejection::WrongCluster {
                received: request.cluster_name.to_string(),
                local: self.inner.cluster_name.to_string(),
            });
        }

        self.inner
            .listeners
            .notify(FaultEvent::PingReceived { request });
        Ok(PingResponse::default())
    }
}
