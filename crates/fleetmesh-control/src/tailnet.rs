//! Server-side connection broker to workspace agents
//!
//! Connections are cached per agent and shared by every caller. Only one
//! construction runs per agent at a time; concurrent callers wait for it.
//! Each handed-out connection comes with a [`Lease`]; once every lease is
//! released the connection idles and is closed after a grace period.

use async_trait::async_trait;
use axum::body::Body;
use fleetmesh_proto::Node;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, StatusCode, Uri};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use fleetmesh_transport::{TransportError, Tunnel, TunnelDialer};

use crate::backoff::sleep_or_cancel;
use crate::capabilities::coordinator::Coordinator;
use crate::capabilities::relay_map::RelayMapSource;
use crate::slot::CapabilitySlot;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
/// How long a proxied request waits for the agent to answer
const AGENT_REACHABLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TailnetOptions {
    /// How long an unreferenced connection stays cached
    pub idle_grace: Duration,
    /// How often idle connections are looked for
    pub eviction_interval: Duration,
}

impl Default for TailnetOptions {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(5 * 60),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Agent {0} is unreachable: no known network identity")]
    AgentUnreachable(Uuid),

    #[error("Failed to connect to agent {agent_id}: {reason}")]
    Dial { agent_id: Uuid, reason: String },

    #[error("Legacy connection to agent {agent_id} failed: {reason}")]
    Legacy { agent_id: Uuid, reason: String },

    #[error("Server tailnet is closed")]
    Closed,
}

/// Releases a connection reference exactly once, on [`Lease::release`] or
/// drop
pub struct Lease {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Lease {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Connection path for agents that only advertise the shared legacy address
#[async_trait]
pub trait LegacyConnCache: Send + Sync {
    async fn acquire(&self, node: &Node) -> Result<(Arc<dyn Tunnel>, Lease), BrokerError>;
}

/// Dials a dedicated tunnel per lease and closes it on release
pub struct EphemeralLegacyConns {
    dialer: Arc<dyn TunnelDialer>,
    relay_maps: Arc<RelayMapSource>,
}

impl EphemeralLegacyConns {
    pub fn new(dialer: Arc<dyn TunnelDialer>, relay_maps: Arc<RelayMapSource>) -> Self {
        Self { dialer, relay_maps }
    }
}

#[async_trait]
impl LegacyConnCache for EphemeralLegacyConns {
    async fn acquire(&self, node: &Node) -> Result<(Arc<dyn Tunnel>, Lease), BrokerError> {
        let tunnel = self
            .dialer
            .dial(node, &self.relay_maps.current())
            .await
            .map_err(|e| BrokerError::Legacy {
                agent_id: node.agent_id,
                reason: e.to_string(),
            })?;

        let held = Arc::clone(&tunnel);
        let lease = Lease::new(move || {
            tokio::spawn(async move { held.close().await });
        });
        Ok((tunnel, lease))
    }
}

type ConnectOutcome = Option<Result<(), BrokerError>>;

enum CacheEntry {
    Connecting(watch::Receiver<ConnectOutcome>),
    Ready(CachedConnection),
}

struct CachedConnection {
    tunnel: Arc<dyn Tunnel>,
    ref_count: usize,
    idle_since: Option<Instant>,
    maintenance: CancellationToken,
}

type ConnTable = Mutex<HashMap<Uuid, CacheEntry>>;

fn lock(conns: &ConnTable) -> MutexGuard<'_, HashMap<Uuid, CacheEntry>> {
    conns.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Step {
    Ready(Arc<dyn Tunnel>),
    Wait(watch::Receiver<ConnectOutcome>),
    Construct(watch::Sender<ConnectOutcome>),
}

/// Removes a `Connecting` placeholder if construction is abandoned
struct PendingGuard<'a> {
    conns: &'a ConnTable,
    agent_id: Uuid,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut conns = lock(self.conns);
        if matches!(conns.get(&self.agent_id), Some(CacheEntry::Connecting(_))) {
            conns.remove(&self.agent_id);
        }
    }
}

pub struct ServerTailnet {
    coordinator: Arc<CapabilitySlot<dyn Coordinator>>,
    relay_maps: Arc<RelayMapSource>,
    dialer: Arc<dyn TunnelDialer>,
    legacy: Arc<dyn LegacyConnCache>,
    options: TailnetOptions,
    conns: Arc<ConnTable>,
    cancel: CancellationToken,
}

impl ServerTailnet {
    pub fn new(
        coordinator: Arc<CapabilitySlot<dyn Coordinator>>,
        relay_maps: Arc<RelayMapSource>,
        dialer: Arc<dyn TunnelDialer>,
        legacy: Arc<dyn LegacyConnCache>,
        options: TailnetOptions,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let tailnet = Arc::new(Self {
            coordinator,
            relay_maps,
            dialer,
            legacy,
            options,
            conns: Arc::new(Mutex::new(HashMap::new())),
            cancel,
        });
        tokio::spawn(evict_loop(Arc::downgrade(&tailnet)));
        tailnet
    }

    /// A connection to `agent_id` and the lease keeping it alive
    pub async fn resolve(&self, agent_id: Uuid) -> Result<(Arc<dyn Tunnel>, Lease), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let node = self
            .coordinator
            .load()
            .node(agent_id)
            .ok_or(BrokerError::AgentUnreachable(agent_id))?;

        if node.is_legacy() {
            debug!(%agent_id, "Using legacy connection path");
            return self.legacy.acquire(&node).await;
        }

        loop {
            let step = {
                let mut conns = lock(&self.conns);
                match conns.get_mut(&agent_id) {
                    Some(CacheEntry::Ready(conn)) => {
                        conn.ref_count += 1;
                        conn.idle_since = None;
                        Step::Ready(Arc::clone(&conn.tunnel))
                    }
                    Some(CacheEntry::Connecting(rx)) => Step::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        conns.insert(agent_id, CacheEntry::Connecting(rx));
                        Step::Construct(tx)
                    }
                }
            };

            match step {
                Step::Ready(tunnel) => return Ok((tunnel, self.lease(agent_id))),
                Step::Construct(tx) => return self.construct(node, tx).await,
                Step::Wait(mut rx) => {
                    let outcome = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|outcome| outcome.clone());
                    if let Some(Err(e)) = outcome {
                        return Err(e);
                    }
                    // Built, or the builder gave up; look again
                }
            }
        }
    }

    async fn construct(
        &self,
        node: Node,
        tx: watch::Sender<ConnectOutcome>,
    ) -> Result<(Arc<dyn Tunnel>, Lease), BrokerError> {
        let agent_id = node.agent_id;
        let mut pending = PendingGuard {
            conns: &self.conns,
            agent_id,
            armed: true,
        };

        let relay_map = self.relay_maps.current();
        let tunnel = match self.dialer.dial(&node, &relay_map).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let error = BrokerError::Dial {
                    agent_id,
                    reason: e.to_string(),
                };
                drop(pending);
                let _ = tx.send(Some(Err(error.clone())));
                warn!(%agent_id, error = %error, "Agent connection failed");
                return Err(error);
            }
        };

        // Checked under the table lock so close() either drains this entry
        // or we see the cancellation here
        let maintenance = self.cancel.child_token();
        let admitted = {
            let mut conns = lock(&self.conns);
            if self.cancel.is_cancelled() {
                false
            } else {
                conns.insert(
                    agent_id,
                    CacheEntry::Ready(CachedConnection {
                        tunnel: Arc::clone(&tunnel),
                        ref_count: 1,
                        idle_since: None,
                        maintenance: maintenance.clone(),
                    }),
                );
                true
            }
        };
        if !admitted {
            drop(pending);
            let _ = tx.send(Some(Err(BrokerError::Closed)));
            tunnel.close().await;
            debug!(%agent_id, "Broker closed while connecting, dropped new connection");
            return Err(BrokerError::Closed);
        }
        pending.disarm();
        let _ = tx.send(Some(Ok(())));

        tokio::spawn(forward_node_updates(
            Arc::clone(&self.coordinator),
            Arc::clone(&tunnel),
            agent_id,
            maintenance,
        ));
        info!(%agent_id, "Agent connection established");
        Ok((tunnel, self.lease(agent_id)))
    }

    fn lease(&self, agent_id: Uuid) -> Lease {
        let conns: Weak<ConnTable> = Arc::downgrade(&self.conns);
        Lease::new(move || {
            let Some(conns) = conns.upgrade() else {
                return;
            };
            let mut conns = lock(&conns);
            if let Some(CacheEntry::Ready(conn)) = conns.get_mut(&agent_id) {
                conn.ref_count = conn.ref_count.saturating_sub(1);
                if conn.ref_count == 0 {
                    conn.idle_since = Some(Instant::now());
                }
            }
        })
    }

    /// Reverse proxy to `target` on the agent. `via` is the public URL the
    /// request arrived on, used in error pages.
    pub async fn reverse_proxy(
        &self,
        target: Url,
        via: Url,
        agent_id: Uuid,
    ) -> Result<(AgentProxy, Lease), BrokerError> {
        let (tunnel, lease) = self.resolve(agent_id).await?;
        Ok((
            AgentProxy {
                tunnel,
                target,
                via,
                agent_id,
            },
            lease,
        ))
    }

    /// Close connections idle for longer than the grace period
    pub async fn evict_idle(&self) -> usize {
        let grace = self.options.idle_grace;
        let evicted: Vec<(Uuid, CachedConnection)> = {
            let mut conns = lock(&self.conns);
            let expired: Vec<Uuid> = conns
                .iter()
                .filter_map(|(agent_id, entry)| match entry {
                    CacheEntry::Ready(conn)
                        if conn.ref_count == 0
                            && conn.idle_since.is_some_and(|since| since.elapsed() >= grace) =>
                    {
                        Some(*agent_id)
                    }
                    _ => None,
                })
                .collect();
            expired
                .into_iter()
                .filter_map(|agent_id| match conns.remove(&agent_id) {
                    Some(CacheEntry::Ready(conn)) => Some((agent_id, conn)),
                    _ => None,
                })
                .collect()
        };

        let count = evicted.len();
        for (agent_id, conn) in evicted {
            conn.maintenance.cancel();
            conn.tunnel.close().await;
            debug!(%agent_id, "Closed idle agent connection");
        }
        count
    }

    /// Cached connection count, including ones still being built
    pub fn cached_connections(&self) -> usize {
        lock(&self.conns).len()
    }

    /// References held on an agent's ready connection
    pub fn ref_count(&self, agent_id: Uuid) -> Option<usize> {
        match lock(&self.conns).get(&agent_id) {
            Some(CacheEntry::Ready(conn)) => Some(conn.ref_count),
            _ => None,
        }
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let drained: Vec<CachedConnection> = lock(&self.conns)
            .drain()
            .filter_map(|(_, entry)| match entry {
                CacheEntry::Ready(conn) => Some(conn),
                CacheEntry::Connecting(_) => None,
            })
            .collect();
        for conn in drained {
            conn.maintenance.cancel();
            conn.tunnel.close().await;
        }
        info!("Server tailnet closed");
    }
}

async fn evict_loop(tailnet: Weak<ServerTailnet>) {
    let (period, cancel) = match tailnet.upgrade() {
        Some(t) => (t.options.eviction_interval, t.cancel.clone()),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let Some(tailnet) = tailnet.upgrade() else {
                    return;
                };
                tailnet.evict_idle().await;
            }
        }
    }
}

/// Keep a cached tunnel in step with the coordinator, following slot swaps
async fn forward_node_updates(
    coordinator: Arc<CapabilitySlot<dyn Coordinator>>,
    tunnel: Arc<dyn Tunnel>,
    agent_id: Uuid,
    cancel: CancellationToken,
) {
    loop {
        let mut updates = coordinator.load().subscribe(agent_id);
        let current = updates.borrow_and_update().clone();
        if let Some(node) = current {
            tunnel.update_node(node);
        }
        loop {
            let changed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = updates.changed() => changed,
            };
            if changed.is_err() {
                break;
            }
            let node = updates.borrow_and_update().clone();
            if let Some(node) = node {
                tunnel.update_node(node);
            }
        }
        debug!(%agent_id, "Coordinator closed, re-subscribing");
        if !sleep_or_cancel(RESUBSCRIBE_DELAY, &cancel).await {
            return;
        }
    }
}

#[derive(Debug, Error)]
enum ProxyError {
    #[error("Target URL has no port")]
    NoPort,

    #[error("Agent did not become reachable within {0:?}")]
    Unreachable(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request URI: {0}")]
    Uri(#[from] http::Error),
}

/// HTTP reverse proxy through an agent tunnel
pub struct AgentProxy {
    tunnel: Arc<dyn Tunnel>,
    target: Url,
    via: Url,
    agent_id: Uuid,
}

impl AgentProxy {
    /// Forward `request`; transport failures become a 502
    pub async fn serve(&self, request: Request<Body>) -> Response<Body> {
        match self.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(agent_id = %self.agent_id, target = %self.target, error = %e, "Agent proxy request failed");
                let mut response = Response::new(Body::from(format!(
                    "Failed to proxy request to agent {} via {}: {}",
                    self.agent_id, self.via, e
                )));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }

    async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let port = self.target.port_or_known_default().ok_or(ProxyError::NoPort)?;
        if !self.tunnel.await_reachable(AGENT_REACHABLE_TIMEOUT).await {
            return Err(ProxyError::Unreachable(AGENT_REACHABLE_TIMEOUT));
        }
        let stream = self.tunnel.open_tcp(port).await?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        let agent_id = self.agent_id;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%agent_id, "Agent proxy connection closed: {}", e);
            }
        });

        let (mut parts, body) = request.into_parts();
        parts.uri = rewrite_uri(&self.target, &parts.uri)?;
        if let Some(host) = self.target.host_str() {
            let authority = match self.target.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&authority) {
                parts.headers.insert(HOST, value);
            }
        }

        let response = sender.send_request(Request::from_parts(parts, body)).await?;
        Ok(response.map(Body::new))
    }
}

/// Join the target's path and query with the incoming request's
fn rewrite_uri(target: &Url, incoming: &Uri) -> Result<Uri, http::Error> {
    let base = target.path().trim_end_matches('/');
    let path = incoming.path();
    let mut path_and_query = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };
    match (target.query(), incoming.query()) {
        (Some(a), Some(b)) => path_and_query.push_str(&format!("?{}&{}", a, b)),
        (Some(q), None) | (None, Some(q)) => path_and_query.push_str(&format!("?{}", q)),
        (None, None) => {}
    }
    Uri::builder().path_and_query(path_and_query).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::coordinator::MemoryCoordinator;
    use crate::capabilities::relay_map::{IdentityAugmenter, RelayMapAugmenter};
    use chrono::Utc;
    use fleetmesh_proto::{RelayMap, LEGACY_AGENT_IP};
    use fleetmesh_transport::{DirectDialer, TransportResult, TunnelStream};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTunnel {
        agent_id: Uuid,
        closed: AtomicBool,
        updates: Mutex<Vec<Node>>,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        fn agent_id(&self) -> Uuid {
            self.agent_id
        }

        async fn await_reachable(&self, _timeout: Duration) -> bool {
            true
        }

        async fn open_tcp(&self, _port: u16) -> TransportResult<Box<dyn TunnelStream>> {
            Err(TransportError::Closed)
        }

        fn update_node(&self, node: Node) {
            self.updates.lock().unwrap().push(node);
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Counts dials; slow enough that concurrent callers overlap
    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicUsize,
        fail: bool,
        tunnels: Mutex<Vec<Arc<FakeTunnel>>>,
    }

    #[async_trait]
    impl TunnelDialer for CountingDialer {
        async fn dial(&self, node: &Node, _relay_map: &RelayMap) -> TransportResult<Arc<dyn Tunnel>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(TransportError::ConnectionFailed("refused".to_string()));
            }
            let tunnel = Arc::new(FakeTunnel {
                agent_id: node.agent_id,
                closed: AtomicBool::new(false),
                updates: Mutex::new(vec![]),
            });
            self.tunnels.lock().unwrap().push(Arc::clone(&tunnel));
            Ok(tunnel)
        }
    }

    #[derive(Default)]
    struct RecordingLegacy {
        acquired: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl LegacyConnCache for RecordingLegacy {
        async fn acquire(&self, node: &Node) -> Result<(Arc<dyn Tunnel>, Lease), BrokerError> {
            self.acquired.lock().unwrap().push(node.agent_id);
            let tunnel: Arc<dyn Tunnel> = Arc::new(FakeTunnel {
                agent_id: node.agent_id,
                closed: AtomicBool::new(false),
                updates: Mutex::new(vec![]),
            });
            Ok((tunnel, Lease::new(|| {})))
        }
    }

    fn node(agent_id: Uuid, addresses: Vec<IpAddr>) -> Node {
        Node {
            agent_id,
            addresses,
            endpoints: vec![],
            preferred_region: 1,
            updated_at: Utc::now(),
        }
    }

    fn modern_ip() -> IpAddr {
        "fd7a:115c:a1e0:4a5b::1".parse().unwrap()
    }

    struct Harness {
        tailnet: Arc<ServerTailnet>,
        coordinator: Arc<CapabilitySlot<dyn Coordinator>>,
        legacy: Arc<RecordingLegacy>,
    }

    fn harness(dialer: Arc<dyn TunnelDialer>, options: TailnetOptions) -> Harness {
        let coordinator: Arc<CapabilitySlot<dyn Coordinator>> = Arc::new(CapabilitySlot::new(
            "coordinator",
            Arc::new(MemoryCoordinator::new()),
        ));
        let augmenter: Arc<CapabilitySlot<dyn RelayMapAugmenter>> =
            Arc::new(CapabilitySlot::new("relay_map", Arc::new(IdentityAugmenter)));
        let relay_maps = Arc::new(RelayMapSource::new(RelayMap::new(), augmenter));
        let legacy = Arc::new(RecordingLegacy::default());
        let tailnet = ServerTailnet::new(
            Arc::clone(&coordinator),
            relay_maps,
            dialer,
            legacy.clone(),
            options,
            CancellationToken::new(),
        );
        Harness {
            tailnet,
            coordinator,
            legacy,
        }
    }

    #[test]
    fn test_rewrite_uri_joins_paths_and_queries() {
        let target = Url::parse("http://127.0.0.1:8080/base/?token=1").unwrap();
        let incoming: Uri = "/app/index.html?x=2".parse().unwrap();
        assert_eq!(
            rewrite_uri(&target, &incoming).unwrap(),
            "/base/app/index.html?token=1&x=2"
        );

        let root = Url::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(rewrite_uri(&root, &"/".parse().unwrap()).unwrap(), "/");
    }

    #[test]
    fn test_lease_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let lease = Lease::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lease.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_connection() {
        let dialer = Arc::new(CountingDialer::default());
        let h = harness(dialer.clone(), TailnetOptions::default());
        let agent_id = Uuid::new_v4();
        h.coordinator
            .load()
            .update_node(node(agent_id, vec![modern_ip()]))
            .await
            .unwrap();

        let resolves = (0..8).map(|_| {
            let tailnet = Arc::clone(&h.tailnet);
            tokio::spawn(async move { tailnet.resolve(agent_id).await })
        });
        let mut leases = vec![];
        for result in futures::future::join_all(resolves).await {
            let (tunnel, lease) = result.unwrap().unwrap();
            assert_eq!(tunnel.agent_id(), agent_id);
            leases.push(lease);
        }

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(h.tailnet.ref_count(agent_id), Some(8));

        leases.pop().unwrap().release();
        assert_eq!(h.tailnet.ref_count(agent_id), Some(7));
        drop(leases);
        assert_eq!(h.tailnet.ref_count(agent_id), Some(0));
        assert_eq!(h.tailnet.cached_connections(), 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_unreachable_and_not_cached() {
        let h = harness(Arc::new(CountingDialer::default()), TailnetOptions::default());
        let agent_id = Uuid::new_v4();

        let err = h.tailnet.resolve(agent_id).await.err().unwrap();
        assert_eq!(err, BrokerError::AgentUnreachable(agent_id));
        assert_eq!(h.tailnet.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_reaches_every_waiter() {
        let dialer = Arc::new(CountingDialer {
            fail: true,
            ..Default::default()
        });
        let h = harness(dialer.clone(), TailnetOptions::default());
        let agent_id = Uuid::new_v4();
        h.coordinator
            .load()
            .update_node(node(agent_id, vec![modern_ip()]))
            .await
            .unwrap();

        let (a, b) = tokio::join!(h.tailnet.resolve(agent_id), h.tailnet.resolve(agent_id));
        assert!(matches!(a, Err(BrokerError::Dial { .. })));
        assert!(matches!(b, Err(BrokerError::Dial { .. })));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(h.tailnet.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_legacy_agents_bypass_the_cache() {
        let dialer = Arc::new(CountingDialer::default());
        let h = harness(dialer.clone(), TailnetOptions::default());
        let agent_id = Uuid::new_v4();
        h.coordinator
            .load()
            .update_node(node(agent_id, vec![IpAddr::V6(LEGACY_AGENT_IP)]))
            .await
            .unwrap();

        let (_tunnel, _lease) = h.tailnet.resolve(agent_id).await.unwrap();
        assert_eq!(*h.legacy.acquired.lock().unwrap(), vec![agent_id]);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert_eq!(h.tailnet.cached_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_are_evicted_after_grace() {
        let dialer = Arc::new(CountingDialer::default());
        let options = TailnetOptions {
            idle_grace: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(3600),
        };
        let h = harness(dialer.clone(), options);
        let agent_id = Uuid::new_v4();
        h.coordinator
            .load()
            .update_node(node(agent_id, vec![modern_ip()]))
            .await
            .unwrap();

        let (_tunnel, lease) = h.tailnet.resolve(agent_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(h.tailnet.evict_idle().await, 0, "held connections stay");

        lease.release();
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(h.tailnet.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(h.tailnet.evict_idle().await, 1);
        assert_eq!(h.tailnet.cached_connections(), 0);
        assert!(dialer.tunnels.lock().unwrap()[0].is_closed());
    }

    #[tokio::test]
    async fn test_node_updates_reach_cached_tunnels() {
        let dialer = Arc::new(CountingDialer::default());
        let h = harness(dialer.clone(), TailnetOptions::default());
        let agent_id = Uuid::new_v4();
        let coordinator = h.coordinator.load();
        coordinator
            .update_node(node(agent_id, vec![modern_ip()]))
            .await
            .unwrap();
        let (_tunnel, _lease) = h.tailnet.resolve(agent_id).await.unwrap();

        let mut moved = node(agent_id, vec![modern_ip()]);
        moved.preferred_region = 7;
        coordinator.update_node(moved).await.unwrap();

        let tunnel = Arc::clone(&dialer.tunnels.lock().unwrap()[0]);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !tunnel
                .updates
                .lock()
                .unwrap()
                .iter()
                .any(|n| n.preferred_region == 7)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("update forwarded");
    }

    #[tokio::test]
    async fn test_reverse_proxy_reaches_agent_service() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/base/hello",
            axum::routing::get(|uri: Uri| async move { format!("agent saw {}", uri) }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let h = harness(
            Arc::new(DirectDialer::new(Duration::from_secs(2))),
            TailnetOptions::default(),
        );
        let agent_id = Uuid::new_v4();
        let mut agent = node(agent_id, vec![modern_ip()]);
        agent.endpoints = vec![addr];
        h.coordinator.load().update_node(agent).await.unwrap();

        let target = Url::parse(&format!("http://127.0.0.1:{}/base", addr.port())).unwrap();
        let via = Url::parse("https://proxy.example.com").unwrap();
        let (proxy, lease) = h
            .tailnet
            .reverse_proxy(target, via, agent_id)
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/hello?q=1")
            .body(Body::empty())
            .unwrap();
        let response = proxy.serve(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"agent saw /base/hello?q=1");

        // Nothing listens on this port: the proxy answers 502 itself
        let dead = Url::parse("http://127.0.0.1:1").unwrap();
        let (proxy, _lease2) = h
            .tailnet
            .reverse_proxy(dead, Url::parse("https://proxy.example.com").unwrap(), agent_id)
            .await
            .unwrap();
        let response = proxy
            .serve(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        drop(lease);
        assert_eq!(h.tailnet.ref_count(agent_id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_dial_discards_the_new_connection() {
        let dialer = Arc::new(CountingDialer::default());
        let h = harness(dialer.clone(), TailnetOptions::default());
        let agent_id = Uuid::new_v4();
        h.coordinator
            .load()
            .update_node(node(agent_id, vec![modern_ip()]))
            .await
            .unwrap();

        let tailnet = Arc::clone(&h.tailnet);
        let resolving = tokio::spawn(async move { tailnet.resolve(agent_id).await.err() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.tailnet.close().await;

        assert_eq!(resolving.await.unwrap(), Some(BrokerError::Closed));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(h.tailnet.cached_connections(), 0);
        assert!(dialer.tunnels.lock().unwrap()[0].is_closed());
    }

    /// Never answers; records whether a stream was attempted anyway
    struct SilentTunnel {
        agent_id: Uuid,
        opened: AtomicBool,
    }

    #[async_trait]
    impl Tunnel for SilentTunnel {
        fn agent_id(&self) -> Uuid {
            self.agent_id
        }

        async fn await_reachable(&self, _timeout: Duration) -> bool {
            false
        }

        async fn open_tcp(&self, _port: u16) -> TransportResult<Box<dyn TunnelStream>> {
            self.opened.store(true, Ordering::SeqCst);
            Err(TransportError::Closed)
        }

        fn update_node(&self, _node: Node) {}

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_unreachable_agent_gets_502_without_opening_a_stream() {
        let agent_id = Uuid::new_v4();
        let tunnel = Arc::new(SilentTunnel {
            agent_id,
            opened: AtomicBool::new(false),
        });
        let proxy = AgentProxy {
            tunnel: tunnel.clone(),
            target: Url::parse("http://127.0.0.1:8080").unwrap(),
            via: Url::parse("https://proxy.example.com").unwrap(),
            agent_id,
        };

        let response = proxy
            .serve(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("did not become reachable"));
        assert!(!tunnel.opened.load(Ordering::SeqCst));
    }
}
