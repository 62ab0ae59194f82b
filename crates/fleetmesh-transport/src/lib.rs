//! Relay transport boundary
//!
//! The control plane never talks to the overlay network directly. It goes
//! through these traits so the relay-capable transport can be swapped out
//! (and faked in tests):
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  RelayMesh (replica links)   │   │  ServerTailnet (agent conns) │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!                │ RelayLinker                    │ TunnelDialer
//!                ↓                                ↓
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                fleetmesh-transport (this crate)                  │
//! │  - RelayLinker / RelayLink      - TunnelDialer / Tunnel          │
//! └─────────────────────────────────────────────────────────────────┘
//!                │ implemented by
//!                ↓
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  direct: plain TCP to relay URLs and node endpoints              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod direct;

use async_trait::async_trait;
use fleetmesh_proto::{Node, RelayMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;
use uuid::Uuid;

pub use direct::{DirectDialer, DirectTunnel, TcpRelayLink, TcpRelayLinker};

/// Transport-level errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),

    #[error("No route to agent {0}")]
    NoRoute(Uuid),

    #[error("Timeout")]
    Timeout,

    #[error("Tunnel closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A byte stream opened through a tunnel
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// An established link to a peer replica's relay
#[async_trait]
pub trait RelayLink: Send {
    /// Resolves once the link is lost
    async fn closed(&mut self);

    /// Tear the link down
    async fn close(&mut self);

    fn address(&self) -> &Url;
}

/// Establishes relay links to peer replicas
#[async_trait]
pub trait RelayLinker: Send + Sync {
    async fn link(&self, address: &Url) -> TransportResult<Box<dyn RelayLink>>;
}

/// A connection to one agent through the overlay
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn agent_id(&self) -> Uuid;

    /// Wait until the agent answers or `timeout` elapses
    async fn await_reachable(&self, timeout: Duration) -> bool;

    /// Open a TCP stream to `port` on the agent
    async fn open_tcp(&self, port: u16) -> TransportResult<Box<dyn TunnelStream>>;

    /// Apply a fresh node descriptor from the coordinator
    fn update_node(&self, node: Node);

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates tunnels to agents, seeded with the relay topology
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self, node: &Node, relay_map: &RelayMap) -> TransportResult<Arc<dyn Tunnel>>;
}
