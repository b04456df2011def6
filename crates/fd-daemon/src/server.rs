//! WebSocket server answering pings from other nodes.
//!
//! Each accepted connection gets our handshake first; every ping request on
//! it is validated by the detector and answered with either a response or a
//! rejection.

use crate::connection::frame_data;
use crate::message::{MAX_MESSAGE_SIZE, WireMessage};
use anyhow::Result;
use fault_detection::NodesFaultDetector;
use futures::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, trace, warn};

pub struct PingServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PingServer {
    /// Bind the listening socket. Serving starts with [`PingServer::serve`],
    /// once the local node identity (which needs the bound address) exists.
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Ping server listening on {}", local_addr);
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the future is dropped. Dropping it also
    /// closes every accepted connection.
    pub async fn serve(self, detector: NodesFaultDetector) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(handle_connection(stream, addr, detector.clone()));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(_) = connections.join_next() => {}
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, detector: NodesFaultDetector) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // port probes close before the upgrade finishes
            debug!("WebSocket upgrade failed for {}: {}", addr, e);
            return;
        }
    };
    debug!("New connection from {}", addr);

    let (mut write, mut read) = ws_stream.split();

    let handshake = WireMessage::Handshake { node: detector.local_node() };
    if let Err(e) = send(&mut write, &handshake).await {
        warn!("Failed to send handshake to {}: {}", addr, e);
        return;
    }

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(Message::Close(_)) => break,
            Ok(msg) => msg,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
            Err(e) => {
                debug!("WebSocket error on {}: {}", addr, e);
                break;
            }
        };
        let Some(data) = frame_data(msg) else {
            continue;
        };
        if data.len() > MAX_MESSAGE_SIZE {
            warn!("Message from {} exceeds max size, dropping", addr);
            continue;
        }

        let reply = match WireMessage::from_binary(&data) {
            Some(WireMessage::Handshake { node }) => {
                debug!("Connection from {} is {}", addr, node);
                continue;
            }
            Some(WireMessage::PingRequest { request_id, request }) => {
                trace!("Ping {} from {}", request_id, request.requester);
                match detector.handle_ping_request(request) {
                    Ok(response) => WireMessage::PingResponse { request_id, response },
                    Err(rejection) => {
                        debug!("Rejecting ping {} from {}: {}", request_id, addr, rejection);
                        WireMessage::PingError { request_id, rejection }
                    }
                }
            }
            Some(other) => {
                trace!("Ignoring unexpected frame from {}: {:?}", addr, other);
                continue;
            }
            None => {
                warn!("Dropping malformed frame from {}", addr);
                continue;
            }
        };

        if let Err(e) = send(&mut write, &reply).await {
            debug!("Failed to reply to {}: {}", addr, e);
            break;
        }
    }

    debug!("Connection from {} closed", addr);
}

async fn send<S>(write: &mut S, message: &WireMessage) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    write.send(Message::Binary(message.to_binary()?)).await?;
    Ok(())
}
