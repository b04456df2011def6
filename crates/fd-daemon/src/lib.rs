//! fd-daemon library: exposes the daemon components for integration tests.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod membership;
pub mod message;
pub mod server;
pub mod transport;

pub use config::DaemonConfig;
pub use connection::{NodeConnection, TransportEvent};
pub use daemon::Daemon;
pub use membership::{MembershipView, RemoveFailedNodes};
pub use message::{MAX_MESSAGE_SIZE, WireMessage};
pub use server::PingServer;
pub use transport::WsTransport;
