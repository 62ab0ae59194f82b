//! Direct TCP transport
//!
//! Reaches agents over their advertised endpoints and holds relay links as
//! plain TCP connections. Used when the deployment has no overlay daemon.

use async_trait::async_trait;
use fleetmesh_proto::{Node, RelayMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use crate::{
    RelayLink, RelayLinker, TransportError, TransportResult, Tunnel, TunnelDialer, TunnelStream,
};

const REACHABLE_RETRY: Duration = Duration::from_millis(100);

/// Dials agents straight at their node endpoints
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TunnelDialer for DirectDialer {
    async fn dial(&self, node: &Node, relay_map: &RelayMap) -> TransportResult<Arc<dyn Tunnel>> {
        if node.endpoints.is_empty() {
            return Err(TransportError::NoRoute(node.agent_id));
        }

        let home = relay_map
            .regions
            .get(&node.preferred_region)
            .map(|r| r.region_code.clone());
        debug!(
            agent_id = %node.agent_id,
            endpoints = node.endpoints.len(),
            home_region = ?home,
            "Dialing agent directly"
        );

        Ok(Arc::new(DirectTunnel {
            agent_id: node.agent_id,
            node: RwLock::new(node.clone()),
            connect_timeout: self.connect_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct DirectTunnel {
    agent_id: Uuid,
    node: RwLock<Node>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl DirectTunnel {
    fn endpoints(&self) -> Vec<SocketAddr> {
        self.node
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .endpoints
            .clone()
    }

    async fn connect(&self, addr: SocketAddr) -> TransportResult<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!("{}: {}", addr, e))),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl Tunnel for DirectTunnel {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    async fn await_reachable(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.is_closed() {
                return false;
            }
            for endpoint in self.endpoints() {
                if self.connect(endpoint).await.is_ok() {
                    return true;
                }
            }
            if Instant::now() + REACHABLE_RETRY > deadline {
                return false;
            }
            sleep(REACHABLE_RETRY).await;
        }
    }

    async fn open_tcp(&self, port: u16) -> TransportResult<Box<dyn TunnelStream>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut last_error = TransportError::NoRoute(self.agent_id);
        for endpoint in self.endpoints() {
            let addr = SocketAddr::new(endpoint.ip(), port);
            match self.connect(addr).await {
                Ok(stream) => {
                    trace!(agent_id = %self.agent_id, %addr, "Opened agent stream");
                    return Ok(Box::new(stream));
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn update_node(&self, node: Node) {
        let mut current = self.node.write().unwrap_or_else(PoisonError::into_inner);
        debug!(agent_id = %self.agent_id, endpoints = node.endpoints.len(), "Node updated");
        *current = node;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Holds relay links open as bare TCP connections
#[derive(Debug, Clone)]
pub struct TcpRelayLinker {
    connect_timeout: Duration,
}

impl TcpRelayLinker {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpRelayLinker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl RelayLinker for TcpRelayLinker {
    async fn link(&self, address: &Url) -> TransportResult<Box<dyn RelayLink>> {
        let host = address
            .host_str()
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
        let port = address
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

        let stream = match timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(TransportError::Timeout),
        };

        Ok(Box::new(TcpRelayLink {
            address: address.clone(),
            stream,
        }))
    }
}

pub struct TcpRelayLink {
    address: Url,
    stream: TcpStream,
}

#[async_trait]
impl RelayLink for TcpRelayLink {
    async fn closed(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn address(&self) -> &Url {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::net::TcpListener;

    fn node(endpoints: Vec<SocketAddr>) -> Node {
        Node {
            agent_id: Uuid::new_v4(),
            addresses: vec!["fd7a:115c:a1e0::1".parse().unwrap()],
            endpoints,
            preferred_region: 1,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dial_without_endpoints_has_no_route() {
        let dialer = DirectDialer::default();
        let result = dialer.dial(&node(vec![]), &RelayMap::new()).await;
        assert!(matches!(result, Err(TransportError::NoRoute(_))));
    }

    #[tokio::test]
    async fn test_open_tcp_reaches_agent_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let tunnel = DirectDialer::default()
            .dial(&node(vec![addr]), &RelayMap::new())
            .await
            .unwrap();

        let mut stream = tunnel.open_tcp(addr.port()).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_closed_tunnel_refuses_streams() {
        let tunnel = DirectDialer::default()
            .dial(&node(vec!["127.0.0.1:9".parse().unwrap()]), &RelayMap::new())
            .await
            .unwrap();

        tunnel.close().await;
        assert!(tunnel.is_closed());
        assert!(matches!(tunnel.open_tcp(80).await, Err(TransportError::Closed)));
        assert!(!tunnel.await_reachable(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_relay_link_reports_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let url = Url::parse(&format!("http://{}", addr)).unwrap();
        let mut link = TcpRelayLinker::default().link(&url).await.unwrap();
        assert_eq!(link.address(), &url);

        server.await.unwrap();
        timeout(Duration::from_secs(5), link.closed())
            .await
            .expect("link loss should be observed");
    }
}
