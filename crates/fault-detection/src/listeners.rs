//! Listener registry for fault detection events.
//!
//! Listeners live in a copy-on-write list: every mutation swaps in a new
//! `Arc<Vec<_>>`, and each notification captures the list as it was when the
//! event was raised. Delivery happens on a dedicated OS thread fed by a
//! bounded queue; subscriber code never runs on a runtime worker.

use crate::messages::PingRequest;
use crate::node::DiscoveryNode;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Event delivered to listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FaultEvent {
    /// A monitored node stopped responding or its connection was lost.
    NodeFailed {
        node: DiscoveryNode,
        reason: String,
    },
    /// A remote node pinged us.
    PingReceived { request: PingRequest },
}

/// Subscriber to fault detection events. Both methods default to no-ops.
///
/// Called from the dispatch thread. A slow listener delays later
/// notifications, never pings.
pub trait FaultListener: Send + Sync {
    fn on_node_failure(&self, _node: &DiscoveryNode, _reason: &str) {}

    fn on_ping_received(&self, _request: &PingRequest) {}
}

/// Handle returned by [`ListenerRegistry::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<Vec<(ListenerId, Arc<dyn FaultListener>)>>;

struct Dispatch {
    event: FaultEvent,
    listeners: ListenerList,
}

pub struct ListenerRegistry {
    listeners: RwLock<ListenerList>,
    next_id: AtomicU64,
    dispatch_tx: mpsc::Sender<Dispatch>,
}

impl ListenerRegistry {
    /// Create a registry and start its dispatch thread.
    ///
    /// At most `capacity` notifications wait for delivery; beyond that they
    /// are dropped. The thread exits once the registry is dropped.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity.max(1));
        thread::Builder::new()
            .name("fault-listeners".into())
            .spawn(move || dispatch_loop(dispatch_rx))?;

        Ok(Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(0),
            dispatch_tx,
        })
    }

    pub fn add(&self, listener: Arc<dyn FaultListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    /// Returns true if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if !guard.iter().any(|(i, _)| *i == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|(i, _)| *i != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an event for delivery to the current listeners.
    ///
    /// Returns false if the event was dropped (queue full or dispatch task
    /// gone). Dropping is logged and never retried.
    pub fn notify(&self, event: FaultEvent) -> bool {
        let dispatch = Dispatch {
            event,
            listeners: self.snapshot(),
        };

        match self.dispatch_tx.try_send(dispatch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dispatch)) => {
                warn!(
                    "Notification queue full, dropping {}",
                    describe(&dispatch.event)
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(dispatch)) => {
                debug!(
                    "Ignoring {}, local node is shutting down",
                    describe(&dispatch.event)
                );
                false
            }
        }
    }

    fn snapshot(&self) -> ListenerList {
        Arc::clone(&self.listeners.read().unwrap_or_else(|e| e.into_inner()))
    }
}

fn dispatch_loop(mut rx: mpsc::Receiver<Dispatch>) {
    while let Some(dispatch) = rx.blocking_recv() {
        deliver(&dispatch);
    }
    debug!("Listener dispatch thread exiting");
}

/// Deliver one event to every listener in the captured list, in insertion order.
fn deliver(dispatch: &Dispatch) {
    for (id, listener) in dispatch.listeners.iter() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &dispatch.event {
            FaultEvent::NodeFailed { node, reason } => listener.on_node_failure(node, reason),
            FaultEvent::PingReceived { request } => listener.on_ping_received(request),
        }));
        if outcome.is_err() {
            error!("Listener {:?} panicked while handling {}", id, describe(&dispatch.event));
        }
    }
}

fn describe(event: &FaultEvent) -> String {
    match event {
        FaultEvent::NodeFailed { node, reason } => {
            format!("node failure for {} (reason [{}])", node, reason)
        }
        FaultEvent::PingReceived { request } => {
            format!("ping from {}", request.requester)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::sync::Mutex;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn node(n: u128) -> DiscoveryNode {
        DiscoveryNode::new(format!("node-{}", n), NodeId::new(n), format!("127.0.0.1:{}", n))
    }

    fn failure(n: u128) -> FaultEvent {
        FaultEvent::NodeFailed {
            node: node(n),
            reason: "test".into(),
        }
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FaultListener for Recorder {
        fn on_node_failure(&self, node: &DiscoveryNode, _reason: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, node.name));
        }
    }

    struct Panicker;

    impl FaultListener for Panicker {
        fn on_node_failure(&self, _node: &DiscoveryNode, _reason: &str) {
            panic!("listener failure");
        }
    }

    /// Reports each call, then blocks until released.
    struct Blocker {
        entered: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl FaultListener for Blocker {
        fn on_node_failure(&self, _node: &DiscoveryNode, _reason: &str) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
    }

    fn wait_for_len(log: &Arc<Mutex<Vec<String>>>, len: usize) {
        for _ in 0..500 {
            if log.lock().unwrap().len() >= len {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {} entries", len);
    }

    #[test]
    fn test_add_remove() {
        let registry = ListenerRegistry::new(16).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = registry.add(Arc::new(Recorder { name: "a", log: log.clone() }));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new(16).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add(Arc::new(Panicker));
        registry.add(Arc::new(Recorder { name: "a", log: log.clone() }));

        assert!(registry.notify(failure(1)));
        assert!(registry.notify(failure(2)));
        wait_for_len(&log, 2);

        assert_eq!(*log.lock().unwrap(), vec!["a:node-1", "a:node-2"]);
    }

    #[test]
    fn test_full_queue_drops_notification() {
        let registry = ListenerRegistry::new(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        registry.add(Arc::new(Blocker {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        registry.add(Arc::new(Recorder { name: "a", log: log.clone() }));

        // first event is taken off the queue and held inside the listener
        assert!(registry.notify(failure(1)));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(registry.notify(failure(2)));
        assert!(!registry.notify(failure(3)));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        wait_for_len(&log, 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*log.lock().unwrap(), vec!["a:node-1", "a:node-2"]);
    }

    #[test]
    fn test_delivery_runs_off_the_calling_thread() {
        let registry = ListenerRegistry::new(4).unwrap();
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        registry.add(Arc::new(Blocker {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));

        // notify returns while the listener is still blocked
        assert!(registry.notify(failure(1)));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(registry.notify(failure(2)));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_fault_event_serialization() {
        let json = serde_json::to_string(&failure(3)).unwrap();
        assert!(json.contains("\"type\":\"nodeFailed\""));
        assert!(json.contains("\"reason\":\"test\""));
    }
}
