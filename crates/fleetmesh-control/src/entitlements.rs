//! Entitlement registry
//!
//! Owns the license resync loop and the capability slots. Each resync
//! recomputes entitlements, swaps any slot whose feature flipped since the
//! last applied resync, then publishes the new snapshot. Resyncs never run
//! concurrently; readers never wait on one.

use arc_swap::ArcSwap;
use chrono::Utc;
use fleetmesh_proto::{Entitlements, FeatureName, RelayMap};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetmesh_transport::RelayLinker;

use crate::backoff::{sleep_or_cancel, Backoff, BackoffConfig};
use crate::capabilities::audit::{Auditor, NopAuditor, TracingAuditor};
use crate::capabilities::coordinator::{
    Coordinator, CoordinatorError, CoordinatorFactory, StandardCoordinatorFactory,
};
use crate::capabilities::gate::{AllowAllGate, BrowserOnlyGate, ConnectivityGate};
use crate::capabilities::quota::{EnforcingQuota, QuotaCommitter, UnlimitedQuota};
use crate::capabilities::relay_map::{
    IdentityAugmenter, ProxyRegionAugmenter, RelayMapAugmenter, RelayMapSource,
};
use crate::capabilities::schedule::{
    AdvancedScheduleStore, BasicScheduleStore, TemplateScheduleStore,
};
use crate::capabilities::Capabilities;
use crate::license::{compute_entitlements, EntitlementInputs, LicenseKeys, PUBSUB_EVENT_LICENSES};
use crate::mesh::RelayMesh;
use crate::proxy_health::{ProxyHealth, ProxyHealthError, ProxyHealthOptions};
use crate::pubsub::Pubsub;
use crate::rate_limit::RateLimitedLog;
use crate::region::RegionAllocator;
use crate::replicas::{ReplicaManager, ReplicaOptions};
use crate::slot;
use crate::store::{Store, StoreError};

pub const TELEMETRY_REQUIRED_ERROR: &str =
    "License requires telemetry but telemetry is disabled";

/// How long a replaced coordinator may stay in use before it is closed
pub const RETIRE_GRACE: Duration = Duration::from_secs(30);

/// Features whose flag drives a capability slot
const SLOT_FEATURES: [FeatureName; 6] = [
    FeatureName::AuditLog,
    FeatureName::BrowserOnly,
    FeatureName::TemplateRbac,
    FeatureName::AdvancedTemplateScheduling,
    FeatureName::WorkspaceProxy,
    FeatureName::HighAvailability,
];

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub replica: ReplicaOptions,
    /// Operator-configured relay topology
    pub relay_map: RelayMap,
    pub license_keys: LicenseKeys,
    pub entitlements_interval: Duration,
    pub proxy_health: ProxyHealthOptions,
    pub backoff: BackoffConfig,
    /// Minimum spacing between repeated allocator warnings
    pub warning_interval: Duration,
    pub telemetry_enabled: bool,
    pub audit_logging: bool,
    pub browser_only: bool,
    pub user_role_management: bool,
    pub scim_enabled: bool,
    pub git_auth_providers: usize,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            replica: ReplicaOptions::default(),
            relay_map: RelayMap::new(),
            license_keys: LicenseKeys::new(),
            entitlements_interval: Duration::from_secs(10 * 60),
            proxy_health: ProxyHealthOptions::default(),
            backoff: BackoffConfig::default(),
            warning_interval: Duration::from_secs(60),
            telemetry_enabled: true,
            audit_logging: true,
            browser_only: false,
            user_role_management: true,
            scim_enabled: false,
            git_auth_providers: 0,
        }
    }
}

impl ControlOptions {
    fn enablements(&self) -> BTreeMap<FeatureName, bool> {
        BTreeMap::from([
            (FeatureName::AuditLog, self.audit_logging),
            (FeatureName::BrowserOnly, self.browser_only),
            (FeatureName::Scim, self.scim_enabled),
            (
                FeatureName::HighAvailability,
                !self.replica.relay_address.is_empty(),
            ),
            (FeatureName::MultipleGitAuth, self.git_auth_providers > 1),
            (FeatureName::TemplateRbac, self.user_role_management),
            (FeatureName::ExternalProvisionerDaemons, true),
            (FeatureName::AdvancedTemplateScheduling, true),
            (FeatureName::WorkspaceProxy, true),
        ])
    }
}

#[derive(Debug, Error)]
pub enum EntitlementsError {
    #[error("Failed to compute entitlements: {0}")]
    Compute(#[from] StoreError),

    #[error("Failed to start proxy health checks: {0}")]
    ProxyHealth(#[from] ProxyHealthError),
}

/// External collaborators the registry is wired to
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub pubsub: Arc<dyn Pubsub>,
    pub linker: Arc<dyn RelayLinker>,
    pub coordinator_factory: Option<Arc<dyn CoordinatorFactory>>,
    pub auditor: Arc<dyn Auditor>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn Store>, pubsub: Arc<dyn Pubsub>, linker: Arc<dyn RelayLinker>) -> Self {
        Self {
            store,
            pubsub,
            linker,
            coordinator_factory: None,
            auditor: Arc::new(TracingAuditor),
        }
    }

    pub fn with_coordinator_factory(mut self, factory: Arc<dyn CoordinatorFactory>) -> Self {
        self.coordinator_factory = Some(factory);
        self
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = auditor;
        self
    }
}

/// Feature flags as last applied to the slots
#[derive(Default)]
struct AppliedFlags {
    flags: BTreeMap<FeatureName, bool>,
}

pub struct EntitlementRegistry {
    options: ControlOptions,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn Pubsub>,
    coordinator_factory: Arc<dyn CoordinatorFactory>,
    auditor: Arc<dyn Auditor>,
    replicas: Arc<ReplicaManager>,
    mesh: Arc<RelayMesh>,
    proxy_health: Arc<ProxyHealth>,
    allocator_warnings: Arc<RateLimitedLog>,
    capabilities: Capabilities,
    relay_maps: Arc<RelayMapSource>,
    entitlements: ArcSwap<Entitlements>,
    applied: Mutex<AppliedFlags>,
    cancel: CancellationToken,
    weak: Weak<EntitlementRegistry>,
}

impl EntitlementRegistry {
    pub fn new(
        options: ControlOptions,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, EntitlementsError> {
        let Collaborators {
            store,
            pubsub,
            linker,
            coordinator_factory,
            auditor,
        } = collaborators;

        let coordinator_factory = coordinator_factory.unwrap_or_else(|| {
            Arc::new(StandardCoordinatorFactory::new(
                options.replica.id,
                Arc::clone(&pubsub),
            ))
        });
        let replicas = ReplicaManager::new(
            options.replica.clone(),
            Arc::clone(&store),
            Arc::clone(&pubsub),
            cancel.child_token(),
        );
        let mesh = Arc::new(RelayMesh::new(
            linker,
            options.backoff.clone(),
            cancel.child_token(),
        ));
        let proxy_health = Arc::new(ProxyHealth::new(
            Arc::clone(&store),
            options.proxy_health.clone(),
        )?);
        let capabilities = Capabilities::new(Arc::clone(&store));
        let relay_maps = Arc::new(RelayMapSource::new(
            options.relay_map.clone(),
            Arc::clone(&capabilities.relay_map),
        ));
        let allocator_warnings = Arc::new(RateLimitedLog::new(options.warning_interval));

        Ok(Arc::new_cyclic(|weak| Self {
            options,
            store,
            pubsub,
            coordinator_factory,
            auditor,
            replicas,
            mesh,
            proxy_health,
            allocator_warnings,
            capabilities,
            relay_maps,
            entitlements: ArcSwap::from_pointee(Entitlements::default()),
            applied: Mutex::new(AppliedFlags::default()),
            cancel,
            weak: weak.clone(),
        }))
    }

    /// Register this replica, run the first resync and start the
    /// background loops
    pub async fn start(self: &Arc<Self>) -> Result<(), EntitlementsError> {
        self.replicas.start().await;

        let health = Arc::clone(&self.proxy_health);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = health.force_update().await {
                warn!(error = %e, "Initial proxy health check failed");
            }
            health.run(cancel).await;
        });

        self.resync().await?;

        tokio::spawn(Arc::clone(self).run());
        info!(
            replica_id = %self.options.replica.id,
            interval_secs = self.options.entitlements_interval.as_secs(),
            "Entitlement registry started"
        );
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let (tx, mut notifications) = mpsc::channel::<()>(1);
        tokio::spawn(Arc::clone(&self).subscribe_licenses(tx));

        let mut resync_backoff = Backoff::new(self.options.backoff.clone());
        let mut wait = self.options.entitlements_interval;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Entitlement loop stopped");
                    return;
                }
                _ = sleep(wait) => {}
                Some(()) = notifications.recv() => {
                    debug!("License update received");
                }
            }

            wait = match self.resync().await {
                Ok(()) => {
                    resync_backoff.reset();
                    self.options.entitlements_interval
                }
                Err(e) => {
                    let delay = resync_backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Entitlement resync failed, keeping previous entitlements");
                    delay
                }
            };
        }
    }

    /// Subscribe to license notifications, retrying with backoff. The
    /// timer in [`Self::run`] keeps resyncing while this is still failing.
    async fn subscribe_licenses(self: Arc<Self>, tx: mpsc::Sender<()>) {
        let mut backoff = Backoff::new(self.options.backoff.clone());
        let subscription = loop {
            let notify = tx.clone();
            let listener = Arc::new(move |_payload: bytes::Bytes| {
                let _ = notify.try_send(());
            });
            match self.pubsub.subscribe(PUBSUB_EVENT_LICENSES, listener).await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to subscribe to license updates");
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return;
                    }
                }
            }
        };
        debug!(attempts = backoff.attempt() + 1, "Subscribed to license updates");

        // Catch up on anything published while unsubscribed
        let _ = tx.try_send(());
        self.cancel.cancelled().await;
        subscription.cancel();
    }

    /// Recompute entitlements and apply them. On failure the previous
    /// snapshot and slots stay in place.
    pub async fn resync(&self) -> Result<(), EntitlementsError> {
        let mut applied = self.applied.lock().await;

        let inputs = EntitlementInputs {
            replica_count: self.replicas.all().len(),
            git_auth_count: self.options.git_auth_providers,
            enablements: self.options.enablements(),
        };
        let mut computed = compute_entitlements(
            self.store.as_ref(),
            &self.options.license_keys,
            &inputs,
            Utc::now(),
        )
        .await?;

        if computed.require_telemetry && !self.options.telemetry_enabled {
            error!("{}", TELEMETRY_REQUIRED_ERROR);
            for feature in computed.features.values_mut() {
                feature.enabled = false;
            }
            computed.errors = vec![TELEMETRY_REQUIRED_ERROR.to_string()];
            self.entitlements.store(Arc::new(computed));
            return Ok(());
        }

        for feature in SLOT_FEATURES {
            let enabled = computed.enabled(feature);
            if applied.flags.get(&feature) == Some(&enabled) {
                continue;
            }
            match self.apply(feature, enabled).await {
                Ok(()) => {
                    info!(%feature, enabled, "Capability updated");
                    applied.flags.insert(feature, enabled);
                }
                Err(e) => {
                    error!(%feature, enabled, error = %e, "Failed to apply capability, will retry on next resync");
                    computed.warnings.push(format!(
                        "{} could not be {}: {}",
                        feature.humanize(),
                        if enabled { "enabled" } else { "disabled" },
                        e
                    ));
                }
            }
        }

        self.entitlements.store(Arc::new(computed));
        Ok(())
    }

    async fn apply(&self, feature: FeatureName, enabled: bool) -> Result<(), CoordinatorError> {
        match feature {
            FeatureName::AuditLog => {
                let next: Arc<dyn Auditor> = if enabled {
                    Arc::clone(&self.auditor)
                } else {
                    Arc::new(NopAuditor)
                };
                self.capabilities.auditor.swap(next);
            }
            FeatureName::BrowserOnly => {
                let next: Arc<dyn ConnectivityGate> = if enabled {
                    Arc::new(BrowserOnlyGate)
                } else {
                    Arc::new(AllowAllGate)
                };
                self.capabilities.gate.swap(next);
            }
            FeatureName::TemplateRbac => {
                let next: Arc<dyn QuotaCommitter> = if enabled {
                    Arc::new(EnforcingQuota::new(Arc::clone(&self.store)))
                } else {
                    Arc::new(UnlimitedQuota)
                };
                self.capabilities.quota.swap(next);
            }
            FeatureName::AdvancedTemplateScheduling => {
                let next: Arc<dyn TemplateScheduleStore> = if enabled {
                    Arc::new(AdvancedScheduleStore::new(Arc::clone(&self.store)))
                } else {
                    Arc::new(BasicScheduleStore::new(Arc::clone(&self.store)))
                };
                self.capabilities.schedules.swap(next);
            }
            FeatureName::WorkspaceProxy => {
                let next: Arc<dyn RelayMapAugmenter> = if enabled {
                    Arc::new(ProxyRegionAugmenter::new(
                        Arc::clone(&self.proxy_health),
                        RegionAllocator::new(Arc::clone(&self.allocator_warnings)),
                    ))
                } else {
                    Arc::new(IdentityAugmenter)
                };
                self.capabilities.relay_map.swap(next);
            }
            FeatureName::HighAvailability => self.apply_high_availability(enabled).await?,
            _ => {}
        }
        Ok(())
    }

    /// Swap coordinator, mesh and replica callback together. Nothing is
    /// installed unless the new coordinator was built.
    async fn apply_high_availability(&self, enabled: bool) -> Result<(), CoordinatorError> {
        let coordinator = self.coordinator_factory.build(enabled).await?;

        let weak = self.weak.clone();
        if enabled {
            self.replicas.set_callback(Arc::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.refresh_mesh();
                    registry.spawn_resync();
                }
            }));
            self.refresh_mesh();
        } else {
            self.mesh.set_addresses(Vec::new());
            self.replicas.set_callback(Arc::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.spawn_resync();
                }
            }));
        }

        let previous = self.capabilities.coordinator.swap(coordinator);
        slot::retire(previous, RETIRE_GRACE, |old: Arc<dyn Coordinator>| async move {
            if let Err(e) = old.close().await {
                warn!(kind = old.kind(), error = %e, "Failed to close replaced coordinator");
            }
        });
        Ok(())
    }

    fn refresh_mesh(&self) {
        let addresses = self
            .replicas
            .regional()
            .into_iter()
            .map(|r| r.relay_address)
            .filter(|address| !address.is_empty())
            .collect();
        self.mesh.set_addresses(addresses);
    }

    fn spawn_resync(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(e) = self.resync().await {
                warn!(error = %e, "Resync after replica change failed");
            }
        });
    }

    /// Latest published snapshot
    pub fn entitlements(&self) -> Arc<Entitlements> {
        self.entitlements.load_full()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn relay_maps(&self) -> &Arc<RelayMapSource> {
        &self.relay_maps
    }

    pub fn replicas(&self) -> &Arc<ReplicaManager> {
        &self.replicas
    }

    pub fn mesh(&self) -> &Arc<RelayMesh> {
        &self.mesh
    }

    pub fn proxy_health(&self) -> &Arc<ProxyHealth> {
        &self.proxy_health
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pubsub(&self) -> &Arc<dyn Pubsub> {
        &self.pubsub
    }

    /// Stop every loop, deregister this replica and close the coordinator
    pub async fn close(&self) {
        self.cancel.cancel();
        self.replicas.close().await;
        self.mesh.close();
        let coordinator = self.capabilities.coordinator.load();
        if let Err(e) = coordinator.close().await {
            warn!(error = %e, "Failed to close coordinator");
        }
        info!("Entitlement registry closed");
    }
}
