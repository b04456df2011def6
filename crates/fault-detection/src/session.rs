//! Per-node ping session.
//!
//! A session pings one node until it is no longer the live session for that
//! node. Liveness is decided by the monitored map alone: a session whose token
//! is not the one stored for its node acts on nothing, including the results
//! of requests it sent while it was still live.

use crate::detector::Inner;
use crate::node::DiscoveryNode;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// How a session's task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionExit {
    /// Superseded, removed, or the detector stopped.
    Inert,
    /// Retry budget exhausted; the node was reported failed.
    Failed,
    /// The connection was lost and handed to the disconnect handler.
    Disconnected,
}

pub(crate) struct PingSession {
    node: DiscoveryNode,
    /// Token compared against the monitored map to decide liveness
    token: u64,
    /// Consecutive failed attempts, reset on every successful response
    retry_count: AtomicU32,
    /// Set once the ping task is spawned; unset while a reconnect is pending
    started: AtomicBool,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl PingSession {
    pub(crate) fn new(node: DiscoveryNode, token: u64) -> Arc<Self> {
        Arc::new(Self {
            node,
            token,
            retry_count: AtomicU32::new(0),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        })
    }

    pub(crate) fn node(&self) -> &DiscoveryNode {
        &self.node
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop future scheduling. Wakes a pending interval timer; a request
    /// already on the wire is left to complete and its result is ignored.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
    }

    /// Ping loop. Runs until the session stops being live.
    ///
    /// Boxed because the disconnect handler it may call starts sessions of
    /// its own.
    pub(crate) fn run(self: Arc<Self>, detector: Arc<Inner>) -> BoxFuture<'static, SessionExit> {
        Box::pin(async move {
            let exit = loop {
                if !detector.is_live(&self) {
                    break SessionExit::Inert;
                }

                if let Some(exit) = self.ping_until_answered(&detector).await {
                    break exit;
                }

                if !self.wait_interval(detector.config().ping_interval).await {
                    break SessionExit::Inert;
                }
            };

            trace!("Ping session {} for {} ended: {:?}", self.token, self.node, exit);
            exit
        })
    }

    /// One ping round: send, and resend on failure until a response arrives
    /// or the retry budget is spent. Attempts are strictly sequential.
    ///
    /// Returns `None` when the node answered and the session should keep
    /// going.
    async fn ping_until_answered(&self, detector: &Arc<Inner>) -> Option<SessionExit> {
        let config = detector.config();
        let timeout = config.ping_timeout;
        let max_retries = config.ping_retry_count;

        loop {
            let request = detector.new_ping_request(&self.node);
            let result = detector.send_ping(&self.node, request, timeout).await;

            if !detector.is_live(self) {
                return Some(SessionExit::Inert);
            }

            let err = match result {
                Ok(_) => {
                    self.retry_count.store(0, Ordering::SeqCst);
                    return None;
                }
                Err(err) => err,
            };

            if err.is_connect_lost() {
                trace!("Connection to {} lost while pinging: {}", self.node, err);
                detector.handle_transport_disconnect(&self.node).await;
                return Some(SessionExit::Disconnected);
            }

            let retry = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            trace!(
                "Failed to ping {}, retry {} out of {}: {}",
                self.node, retry, max_retries, err
            );

            if retry >= max_retries {
                debug!(
                    "Failed to ping {}, tried {} times, each with maximum {:?} timeout",
                    self.node, max_retries, timeout
                );
                if detector.remove_session(self) {
                    detector.notify_node_failure(
                        &self.node,
                        failure_reason(max_retries, timeout),
                    );
                    return Some(SessionExit::Failed);
                }
                return Some(SessionExit::Inert);
            }
            // resend right away; the per-attempt timeout is the only throttle
        }
    }

    /// Returns false if the session was cancelled before the interval elapsed.
    async fn wait_interval(&self, interval: Duration) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => !self.cancelled.load(Ordering::SeqCst),
            _ = self.cancel_notify.notified() => false,
        }
    }
}

pub(crate) fn failure_reason(retries: u32, timeout: Duration) -> String {
    format!(
        "failed to ping, tried [{}] times, each with maximum [{:?}] timeout",
        retries, timeout
    )
}
