//! Outgoing node connections.
//!
//! A connection is opened to a node's address, both sides exchange a
//! handshake carrying their identity, and pings are then correlated with
//! their responses by request id. When the read half ends, every pending
//! ping fails with a connect-lost error and the transport is told the node
//! disconnected.

use crate::message::{MAX_MESSAGE_SIZE, WireMessage};
use dashmap::DashMap;
use fault_detection::{DiscoveryNode, PingRequest, PingResponse, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, trace, warn};

/// How long to wait for the remote handshake after the socket opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = DashMap<u64, oneshot::Sender<Result<PingResponse, TransportError>>>;

/// Emitted by the transport for the daemon's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection to this node closed.
    Disconnected(DiscoveryNode),
}

/// An outgoing WebSocket connection to one node.
pub struct NodeConnection {
    /// Identity the remote announced in its handshake
    remote: DiscoveryNode,
    write: Mutex<SplitSink<WsStream, Message>>,
    pending: Arc<PendingMap>,
    next_request_id: AtomicU64,
    closed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
}

impl NodeConnection {
    /// Connect to `address` and exchange handshakes.
    pub async fn open(
        address: &str,
        local: &DiscoveryNode,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let url = format!("ws://{}", address);
        debug!("Connecting to {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let handshake = WireMessage::Handshake { node: local.clone() };
        send_frame(&mut write, &handshake).await?;

        let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut read))
            .await
            .map_err(|_| {
                TransportError::ConnectFailed(format!(
                    "no handshake from {} within {:?}",
                    address, HANDSHAKE_TIMEOUT
                ))
            })??;
        debug!("Connected to {} at {}", remote, address);

        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let read_task = tokio::spawn(read_loop(
            remote.clone(),
            read,
            Arc::clone(&pending),
            Arc::clone(&closed),
            event_tx,
        ));

        Ok(Self {
            remote,
            write: Mutex::new(write),
            pending,
            next_request_id: AtomicU64::new(1),
            closed,
            read_task,
        })
    }

    pub fn remote(&self) -> &DiscoveryNode {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a ping and wait up to `timeout` for the matching response.
    pub async fn ping(
        &self,
        request: PingRequest,
        timeout: Duration,
    ) -> Result<PingResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectLost(format!(
                "connection to {} is closed",
                self.remote
            )));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let frame = WireMessage::PingRequest { request_id, request };
        let sent = {
            let mut write = self.write.lock().await;
            send_frame(&mut write, &frame).await
        };
        if let Err(e) = sent {
            self.pending.remove(&request_id);
            return Err(TransportError::ConnectLost(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // sender dropped by the read loop on close
            Ok(Err(_)) => Err(TransportError::ConnectLost(format!(
                "connection to {} closed",
                self.remote
            ))),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Close the connection without reporting a disconnect.
    pub async fn close(&self) {
        self.read_task.abort();
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

async fn send_frame(
    write: &mut SplitSink<WsStream, Message>,
    message: &WireMessage,
) -> Result<(), TransportError> {
    let data = message
        .to_binary()
        .map_err(|e| TransportError::Other(format!("failed to encode frame: {}", e)))?;
    write
        .send(Message::Binary(data))
        .await
        .map_err(|e| TransportError::ConnectLost(format!("failed to send frame: {}", e)))
}

/// Extract frame bytes from a WebSocket message. None for control frames.
pub(crate) fn frame_data(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Binary(data) => Some(data),
        Message::Text(text) => Some(text.into_bytes()),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) | Message::Close(_) => None,
    }
}

async fn read_handshake(read: &mut SplitStream<WsStream>) -> Result<DiscoveryNode, TransportError> {
    while let Some(msg) = read.next().await {
        let msg =
            msg.map_err(|e| TransportError::ConnectFailed(format!("handshake failed: {}", e)))?;
        if let Message::Close(_) = msg {
            break;
        }
        let Some(data) = frame_data(msg) else {
            continue;
        };
        match WireMessage::from_binary(&data) {
            Some(WireMessage::Handshake { node }) => return Ok(node),
            _ => {
                return Err(TransportError::ConnectFailed(
                    "expected handshake as first frame".to_string(),
                ));
            }
        }
    }
    Err(TransportError::ConnectFailed("connection closed during handshake".to_string()))
}

/// Route responses to their waiting pings until the stream ends.
async fn read_loop(
    remote: DiscoveryNode,
    mut read: SplitStream<WsStream>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match read.next().await {
            Some(Ok(Message::Close(_))) => {
                debug!("Received close frame from {}", remote);
                break;
            }
            Some(Ok(msg)) => {
                let Some(data) = frame_data(msg) else {
                    continue;
                };
                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds max size ({} > {}), dropping",
                        remote,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                match WireMessage::from_binary(&data) {
                    Some(WireMessage::PingResponse { request_id, response }) => {
                        complete(&pending, request_id, Ok(response));
                    }
                    Some(WireMessage::PingError { request_id, rejection }) => {
                        let err = TransportError::Remote(rejection.to_string());
                        complete(&pending, request_id, Err(err));
                    }
                    Some(other) => trace!("Ignoring unexpected frame from {}: {:?}", remote, other),
                    None => warn!("Dropping malformed frame from {}", remote),
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection to {} closed", remote);
                    }
                    _ => debug!("WebSocket error on connection to {}: {}", remote, e),
                }
                break;
            }
            None => {
                debug!("Connection to {} stream ended", remote);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // dropping the senders fails every in-flight ping with connect-lost
    pending.clear();
    let _ = event_tx.send(TransportEvent::Disconnected(remote));
}

fn complete(pending: &PendingMap, request_id: u64, result: Result<PingResponse, TransportError>) {
    match pending.remove(&request_id) {
        Some((_, tx)) => {
            let _ = tx.send(result);
        }
        // the ping already timed out
        None => trace!("No pending ping for request {}", request_id),
    }
}
