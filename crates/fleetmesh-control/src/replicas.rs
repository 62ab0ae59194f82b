//! Replica discovery
//!
//! Every replica upserts its own record on a fixed cadence and tells peers
//! over the `replica` channel. Peers whose record has not been refreshed
//! within three announce intervals drop out of the peer set. Long-dead
//! records are purged periodically.

use bytes::Bytes;
use chrono::Utc;
use fleetmesh_proto::{RegionId, Replica};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pubsub::{Pubsub, PubsubError, Subscription};
use crate::store::{Store, StoreError};

pub const PUBSUB_EVENT_REPLICA: &str = "replica";

/// Invoked when the peer set or a peer's relay address changes
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub id: Uuid,
    pub hostname: String,
    /// Relay URL peers should mesh with; empty disables meshing
    pub relay_address: String,
    pub region_id: RegionId,
    pub update_interval: Duration,
    pub cleanup_interval: Duration,
    /// Records older than this are deleted by the cleanup pass
    pub cleanup_age: Duration,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            hostname: "localhost".to_string(),
            relay_address: String::new(),
            region_id: 999,
            update_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30 * 60),
            cleanup_age: Duration::from_secs(60 * 60),
        }
    }
}

impl ReplicaOptions {
    pub fn stale_after(&self) -> Duration {
        self.update_interval * 3
    }
}

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pubsub(#[from] PubsubError),

    #[error("Invalid duration: {0}")]
    Duration(#[from] chrono::OutOfRangeError),
}

pub struct ReplicaManager {
    options: ReplicaOptions,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    self_replica: RwLock<Replica>,
    peers: RwLock<Vec<Replica>>,
    callback: RwLock<Option<ChangeCallback>>,
    subscription: Mutex<Option<Subscription>>,
    sync_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl ReplicaManager {
    pub fn new(
        options: ReplicaOptions,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn Pubsub>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let now = Utc::now();
        let self_replica = Replica {
            id: options.id,
            hostname: options.hostname.clone(),
            relay_address: options.relay_address.clone(),
            region_id: options.region_id,
            started_at: now,
            last_seen_at: now,
            is_self: true,
        };

        Arc::new(Self {
            options,
            store,
            pubsub,
            self_replica: RwLock::new(self_replica),
            peers: RwLock::new(Vec::new()),
            callback: RwLock::new(None),
            subscription: Mutex::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
            cancel,
        })
    }

    /// Announce this replica, load peers and start the background loop.
    /// Storage and pubsub failures are logged; the loop keeps retrying.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.announce().await {
            warn!(error = %e, "Failed to announce replica");
        }

        let (tx, rx) = mpsc::channel::<()>(1);
        let self_id = self.options.id;
        let listener = Arc::new(move |payload: Bytes| {
            let from_self = std::str::from_utf8(&payload)
                .ok()
                .and_then(|s| s.parse::<Uuid>().ok())
                .is_some_and(|id| id == self_id);
            if !from_self {
                let _ = tx.try_send(());
            }
        });
        match self.pubsub.subscribe(PUBSUB_EVENT_REPLICA, listener).await {
            Ok(subscription) => {
                *self
                    .subscription
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
            }
            Err(e) => warn!(error = %e, "Replica notifications unavailable, relying on periodic sync"),
        }

        if let Err(e) = self.sync().await {
            warn!(error = %e, "Failed to sync replicas");
        }

        info!(
            replica_id = %self.options.id,
            hostname = %self.options.hostname,
            relay_address = %self.options.relay_address,
            "Replica started"
        );

        tokio::spawn(Arc::clone(self).run(rx));
    }

    async fn run(self: Arc<Self>, mut notifications: mpsc::Receiver<()>) {
        let mut announce = interval(self.options.update_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        announce.tick().await;
        let mut cleanup = interval(self.options.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Replica loop stopped");
                    return;
                }
                _ = announce.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!(error = %e, "Failed to announce replica");
                    }
                    if let Err(e) = self.sync().await {
                        warn!(error = %e, "Failed to sync replicas");
                    }
                }
                Some(()) = notifications.recv() => {
                    if let Err(e) = self.sync().await {
                        warn!(error = %e, "Failed to sync replicas");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        warn!(error = %e, "Failed to clean up replicas");
                    }
                }
            }
        }
    }

    async fn announce(&self) -> Result<(), ReplicaError> {
        let record = {
            let mut me = self
                .self_replica
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            me.last_seen_at = Utc::now();
            me.clone()
        };
        self.store.upsert_replica(record).await?;
        self.pubsub
            .publish(PUBSUB_EVENT_REPLICA, Bytes::from(self.options.id.to_string()))
            .await?;
        Ok(())
    }

    /// Reload the peer set from storage, firing the change callback if
    /// membership or any relay address changed
    pub async fn sync(&self) -> Result<(), ReplicaError> {
        let _guard = self.sync_lock.lock().await;

        let since = Utc::now() - chrono::Duration::from_std(self.options.stale_after())?;
        let mut peers: Vec<Replica> = self
            .store
            .replicas_seen_since(since)
            .await?
            .into_iter()
            .filter(|r| r.id != self.options.id)
            .map(|r| Replica { is_self: false, ..r })
            .collect();
        peers.sort_by_key(|r| r.id);

        let changed = {
            let mut current = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            let changed = membership_differs(&current, &peers);
            *current = peers;
            changed
        };

        if changed {
            info!(peers = self.peers().len(), "Replica set changed");
            let callback = self
                .callback
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ReplicaError> {
        let before = Utc::now() - chrono::Duration::from_std(self.options.cleanup_age)?;
        let removed = self.store.delete_replicas_seen_before(before).await?;
        if removed > 0 {
            info!(removed, "Removed stale replica records");
        }
        Ok(())
    }

    pub fn set_callback(&self, callback: ChangeCallback) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn id(&self) -> Uuid {
        self.options.id
    }

    pub fn self_replica(&self) -> Replica {
        self.self_replica
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live peers, excluding this replica, in id order
    pub fn peers(&self) -> Vec<Replica> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// This replica followed by its live peers
    pub fn all(&self) -> Vec<Replica> {
        let mut all = vec![self.self_replica()];
        all.extend(self.peers());
        all
    }

    /// Live peers in this replica's region
    pub fn regional(&self) -> Vec<Replica> {
        self.peers()
            .into_iter()
            .filter(|r| r.region_id == self.options.region_id)
            .collect()
    }

    /// The longest-running replica, ties broken by id
    pub fn primary(&self) -> Replica {
        self.all()
            .into_iter()
            .min_by_key(|r| (r.started_at, r.id))
            .unwrap_or_else(|| self.self_replica())
    }

    pub fn is_primary(&self) -> bool {
        self.primary().id == self.options.id
    }

    /// Stop the loop and deregister this replica
    pub async fn close(&self) {
        self.cancel.cancel();
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);

        if let Err(e) = self.store.delete_replica(self.options.id).await {
            warn!(error = %e, "Failed to deregister replica");
            return;
        }
        if let Err(e) = self
            .pubsub
            .publish(PUBSUB_EVENT_REPLICA, Bytes::from(self.options.id.to_string()))
            .await
        {
            warn!(error = %e, "Failed to notify peers of shutdown");
        }
        info!(replica_id = %self.options.id, "Replica deregistered");
    }
}

fn membership_differs(current: &[Replica], next: &[Replica]) -> bool {
    current.len() != next.len()
        || current
            .iter()
            .zip(next)
            .any(|(a, b)| a.id != b.id || a.relay_address != b.relay_address)
}
