//! Tailnet node coordination
//!
//! The coordinator is the source of truth for each agent's current network
//! identity. The memory coordinator only knows nodes reported to this
//! replica; the high-availability coordinator shares updates with peer
//! replicas over the `tailnet_coordinator` channel.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fleetmesh_proto::Node;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pubsub::{Pubsub, PubsubError, Subscription};

pub const PUBSUB_EVENT_COORDINATOR: &str = "tailnet_coordinator";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator pubsub error: {0}")]
    Pubsub(#[from] PubsubError),

    #[error("Failed to encode node update: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Coordinator is closed")]
    Closed,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    fn kind(&self) -> &'static str;

    fn node(&self, agent_id: Uuid) -> Option<Node>;

    /// Watch an agent's node. The receiver errors once this coordinator is
    /// closed, telling the holder to re-subscribe to whichever coordinator
    /// is current.
    fn subscribe(&self, agent_id: Uuid) -> watch::Receiver<Option<Node>>;

    async fn update_node(&self, node: Node) -> Result<(), CoordinatorError>;

    async fn close(&self) -> Result<(), CoordinatorError>;
}

#[derive(Default)]
struct NodeTable {
    nodes: DashMap<Uuid, watch::Sender<Option<Node>>>,
}

impl NodeTable {
    fn get(&self, agent_id: Uuid) -> Option<Node> {
        self.nodes
            .get(&agent_id)
            .and_then(|sender| sender.borrow().clone())
    }

    fn subscribe(&self, agent_id: Uuid) -> watch::Receiver<Option<Node>> {
        self.nodes
            .entry(agent_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    fn set(&self, node: Node) {
        let agent_id = node.agent_id;
        self.nodes
            .entry(agent_id)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(node));
    }

    fn clear(&self) {
        self.nodes.clear();
    }
}

/// Single-replica coordinator
#[derive(Default)]
pub struct MemoryCoordinator {
    table: NodeTable,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn node(&self, agent_id: Uuid) -> Option<Node> {
        self.table.get(agent_id)
    }

    fn subscribe(&self, agent_id: Uuid) -> watch::Receiver<Option<Node>> {
        if self.closed.load(Ordering::SeqCst) {
            return watch::channel(None).1;
        }
        self.table.subscribe(agent_id)
    }

    async fn update_node(&self, node: Node) -> Result<(), CoordinatorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        self.table.set(node);
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinatorError> {
        self.closed.store(true, Ordering::SeqCst);
        self.table.clear();
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeUpdate {
    replica_id: Uuid,
    node: Node,
}

/// Coordinator that fans node updates out to every replica
pub struct HaCoordinator {
    replica_id: Uuid,
    table: Arc<NodeTable>,
    pubsub: Arc<dyn Pubsub>,
    subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl HaCoordinator {
    pub async fn new(replica_id: Uuid, pubsub: Arc<dyn Pubsub>) -> Result<Self, CoordinatorError> {
        let table = Arc::new(NodeTable::default());

        let listener_table = Arc::clone(&table);
        let subscription = pubsub
            .subscribe(
                PUBSUB_EVENT_COORDINATOR,
                Arc::new(move |payload: Bytes| {
                    match serde_json::from_slice::<NodeUpdate>(&payload) {
                        Ok(update) if update.replica_id != replica_id => {
                            debug!(agent_id = %update.node.agent_id, from = %update.replica_id, "Peer node update");
                            listener_table.set(update.node);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Discarding malformed node update"),
                    }
                }),
            )
            .await?;

        Ok(Self {
            replica_id,
            table,
            pubsub,
            subscription: Mutex::new(Some(subscription)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Coordinator for HaCoordinator {
    fn kind(&self) -> &'static str {
        "high_availability"
    }

    fn node(&self, agent_id: Uuid) -> Option<Node> {
        self.table.get(agent_id)
    }

    fn subscribe(&self, agent_id: Uuid) -> watch::Receiver<Option<Node>> {
        if self.closed.load(Ordering::SeqCst) {
            return watch::channel(None).1;
        }
        self.table.subscribe(agent_id)
    }

    async fn update_node(&self, node: Node) -> Result<(), CoordinatorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        let payload = serde_json::to_vec(&NodeUpdate {
            replica_id: self.replica_id,
            node: node.clone(),
        })?;
        self.table.set(node);
        self.pubsub
            .publish(PUBSUB_EVENT_COORDINATOR, Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinatorError> {
        self.closed.store(true, Ordering::SeqCst);
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);
        self.table.clear();
        Ok(())
    }
}

/// Builds the coordinator for the current high-availability entitlement
#[async_trait]
pub trait CoordinatorFactory: Send + Sync {
    async fn build(&self, high_availability: bool) -> Result<Arc<dyn Coordinator>, CoordinatorError>;
}

pub struct StandardCoordinatorFactory {
    replica_id: Uuid,
    pubsub: Arc<dyn Pubsub>,
}

impl StandardCoordinatorFactory {
    pub fn new(replica_id: Uuid, pubsub: Arc<dyn Pubsub>) -> Self {
        Self { replica_id, pubsub }
    }
}

#[async_trait]
impl CoordinatorFactory for StandardCoordinatorFactory {
    async fn build(&self, high_availability: bool) -> Result<Arc<dyn Coordinator>, CoordinatorError> {
        if high_availability {
            let coordinator = HaCoordinator::new(self.replica_id, Arc::clone(&self.pubsub)).await?;
            Ok(Arc::new(coordinator))
        } else {
            Ok(Arc::new(MemoryCoordinator::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryPubsub;
    use chrono::Utc;

    fn node(agent_id: Uuid) -> Node {
        Node {
            agent_id,
            addresses: vec!["fd7a:115c:a1e0::7".parse().unwrap()],
            endpoints: vec![],
            preferred_region: 999,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_coordinator_notifies_subscribers() {
        let coordinator = MemoryCoordinator::new();
        let agent = Uuid::new_v4();

        assert!(coordinator.node(agent).is_none());
        let mut updates = coordinator.subscribe(agent);

        coordinator.update_node(node(agent)).await.unwrap();
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().as_ref().map(|n| n.agent_id), Some(agent));
        assert!(coordinator.node(agent).is_some());

        coordinator.close().await.unwrap();
        assert!(updates.changed().await.is_err());
        assert!(matches!(
            coordinator.update_node(node(agent)).await,
            Err(CoordinatorError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ha_coordinators_share_nodes() {
        let pubsub: Arc<dyn Pubsub> = Arc::new(MemoryPubsub::new());
        let first = HaCoordinator::new(Uuid::new_v4(), Arc::clone(&pubsub)).await.unwrap();
        let second = HaCoordinator::new(Uuid::new_v4(), Arc::clone(&pubsub)).await.unwrap();
        let agent = Uuid::new_v4();

        first.update_node(node(agent)).await.unwrap();

        assert_eq!(second.node(agent).map(|n| n.agent_id), Some(agent));
        assert_eq!(first.node(agent).map(|n| n.agent_id), Some(agent));

        second.close().await.unwrap();
        let later = Uuid::new_v4();
        first.update_node(node(later)).await.unwrap();
        assert!(second.node(later).is_none());
    }
}
