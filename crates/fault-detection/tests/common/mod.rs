//! Shared test utilities: a scripted in-memory transport and a recording listener.

#![allow(dead_code)]

use async_trait::async_trait;
use fault_detection::{
    ClusterName, DiscoveryNode, FaultDetectionConfig, FaultEvent, FaultListener, NodeId,
    NodesFaultDetector, PingRequest, PingResponse, PingTransport, TransportError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What the transport does with one ping.
#[derive(Clone)]
pub enum Reply {
    Ack,
    Fail(TransportError),
    /// Wait until the gate is opened, then reply.
    Gated(Arc<Notify>, Box<Reply>),
    /// Never complete.
    Hang,
}

impl Reply {
    pub fn timeout() -> Self {
        Reply::Fail(TransportError::Timeout(Duration::from_millis(1)))
    }

    pub fn connect_lost() -> Self {
        Reply::Fail(TransportError::ConnectLost("connection closed".into()))
    }
}

#[derive(Debug, Clone)]
pub struct SentPing {
    pub target: DiscoveryNode,
    pub request: PingRequest,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<DiscoveryNode, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<DiscoveryNode, Reply>>,
    refuse_connect: Mutex<Vec<DiscoveryNode>>,
    connect_gates: Mutex<HashMap<DiscoveryNode, Arc<Notify>>>,
    sent: Mutex<Vec<SentPing>>,
    connects: Mutex<Vec<DiscoveryNode>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replies used, in order, before falling back to the default.
    pub fn script(&self, node: &DiscoveryNode, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(node.clone())
            .or_default()
            .extend(replies);
    }

    /// Reply used once the script is exhausted (`Ack` if unset).
    pub fn set_default(&self, node: &DiscoveryNode, reply: Reply) {
        self.defaults.lock().unwrap().insert(node.clone(), reply);
    }

    pub fn refuse_connect(&self, node: &DiscoveryNode) {
        self.refuse_connect.lock().unwrap().push(node.clone());
    }

    /// Hold every `connect` to `node` until the gate is opened.
    pub fn gate_connect(&self, node: &DiscoveryNode, gate: Arc<Notify>) {
        self.connect_gates.lock().unwrap().insert(node.clone(), gate);
    }

    pub fn sent_to(&self, node: &DiscoveryNode) -> Vec<SentPing> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| &p.target == node)
            .cloned()
            .collect()
    }

    pub fn send_count(&self, node: &DiscoveryNode) -> usize {
        self.sent_to(node).len()
    }

    pub fn connect_count(&self, node: &DiscoveryNode) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|n| *n == node)
            .count()
    }

    fn next_reply(&self, node: &DiscoveryNode) -> Reply {
        if let Some(reply) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(node)
            .and_then(|script| script.pop_front())
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or(Reply::Ack)
    }
}

async fn play(reply: Reply) -> Result<PingResponse, TransportError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Ack => return Ok(PingResponse::default()),
            Reply::Fail(err) => return Err(err),
            Reply::Gated(gate, then) => {
                gate.notified().await;
                reply = *then;
            }
            Reply::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl PingTransport for MockTransport {
    async fn send_ping(
        &self,
        target: &DiscoveryNode,
        request: PingRequest,
        _timeout: Duration,
    ) -> Result<PingResponse, TransportError> {
        self.sent.lock().unwrap().push(SentPing {
            target: target.clone(),
            request,
            at: Instant::now(),
        });
        let reply = self.next_reply(target);
        play(reply).await
    }

    async fn connect(&self, target: &DiscoveryNode) -> Result<(), TransportError> {
        self.connects.lock().unwrap().push(target.clone());
        let gate = self.connect_gates.lock().unwrap().get(target).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.refuse_connect.lock().unwrap().contains(target) {
            return Err(TransportError::ConnectFailed(format!("{} refused", target)));
        }
        Ok(())
    }
}

/// Listener that records every event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<FaultEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(node, reason)` for every failure seen.
    pub fn failures(&self) -> Vec<(DiscoveryNode, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FaultEvent::NodeFailed { node, reason } => Some((node.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> Vec<PingRequest> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FaultEvent::PingReceived { request } => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_failures(&self, count: usize) -> Vec<(DiscoveryNode, String)> {
        wait_until(|| self.failures().len() >= count).await;
        self.failures()
    }
}

impl FaultListener for RecordingListener {
    fn on_node_failure(&self, node: &DiscoveryNode, reason: &str) {
        self.events.lock().unwrap().push(FaultEvent::NodeFailed {
            node: node.clone(),
            reason: reason.to_string(),
        });
    }

    fn on_ping_received(&self, request: &PingRequest) {
        self.events.lock().unwrap().push(FaultEvent::PingReceived {
            request: request.clone(),
        });
    }
}

/// Poll `condition` every 5ms for up to 5 seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn node(n: u64) -> DiscoveryNode {
    DiscoveryNode::new(
        format!("node-{}", n),
        NodeId::new(n.into()),
        format!("127.0.0.1:{}", 9300 + n),
    )
}

pub fn fast_config() -> FaultDetectionConfig {
    FaultDetectionConfig {
        ping_interval: Duration::from_millis(20),
        ping_timeout: Duration::from_millis(200),
        ping_retry_count: 3,
        ..Default::default()
    }
}

pub fn detector(
    config: FaultDetectionConfig,
    local: &DiscoveryNode,
    transport: &Arc<MockTransport>,
) -> (NodesFaultDetector, Arc<RecordingListener>) {
    let fd = NodesFaultDetector::new(
        config,
        ClusterName::new("test-cluster"),
        local.clone(),
        transport.clone(),
        || 42,
    )
    .expect("valid config");
    let listener = RecordingListener::new();
    fd.add_listener(listener.clone());
    (fd, listener)
}
