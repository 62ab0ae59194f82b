//! Relay map augmentation

use arc_swap::ArcSwap;
use fleetmesh_proto::RelayMap;
use std::sync::Arc;

use crate::proxy_health::ProxyHealth;
use crate::region::RegionAllocator;
use crate::slot::CapabilitySlot;

pub trait RelayMapAugmenter: Send + Sync {
    fn kind(&self) -> &'static str;

    fn augment(&self, base: &RelayMap) -> RelayMap;
}

/// Serves the operator's relay map untouched
pub struct IdentityAugmenter;

impl RelayMapAugmenter for IdentityAugmenter {
    fn kind(&self) -> &'static str {
        "identity"
    }

    fn augment(&self, base: &RelayMap) -> RelayMap {
        base.clone()
    }
}

/// Adds a region for each healthy relay-enabled edge proxy
pub struct ProxyRegionAugmenter {
    health: Arc<ProxyHealth>,
    allocator: RegionAllocator,
}

impl ProxyRegionAugmenter {
    pub fn new(health: Arc<ProxyHealth>, allocator: RegionAllocator) -> Self {
        Self { health, allocator }
    }
}

impl RelayMapAugmenter for ProxyRegionAugmenter {
    fn kind(&self) -> &'static str {
        "proxy_regions"
    }

    fn augment(&self, base: &RelayMap) -> RelayMap {
        self.allocator
            .augment(base, &self.health.healthy_relay_proxies())
    }
}

/// The relay map clients and the server tailnet should use right now
pub struct RelayMapSource {
    base: ArcSwap<RelayMap>,
    augmenter: Arc<CapabilitySlot<dyn RelayMapAugmenter>>,
}

impl RelayMapSource {
    pub fn new(base: RelayMap, augmenter: Arc<CapabilitySlot<dyn RelayMapAugmenter>>) -> Self {
        Self {
            base: ArcSwap::from_pointee(base),
            augmenter,
        }
    }

    /// Operator-configured map without proxy regions
    pub fn base(&self) -> Arc<RelayMap> {
        self.base.load_full()
    }

    pub fn set_base(&self, base: RelayMap) {
        self.base.store(Arc::new(base));
    }

    pub fn current(&self) -> RelayMap {
        self.augmenter.load().augment(&self.base.load())
    }
}
