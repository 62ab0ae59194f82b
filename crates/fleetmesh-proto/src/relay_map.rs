//! Relay topology
//!
//! A relay map lists the regions a client may use to reach a workspace
//! agent when no direct path exists. Region ids are unique within a map and
//! so are region codes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Numeric relay region identifier
pub type RegionId = i64;

/// A single relay server inside a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RelayNode {
    pub name: String,
    pub region_id: RegionId,
    pub host_name: String,
    pub relay_port: u16,
    /// Negative disables STUN for this node
    pub stun_port: i32,
    /// Speak plain HTTP to the relay instead of TLS
    #[serde(default)]
    pub force_plaintext: bool,
}

/// A relay region: an id, a short code and its nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RelayRegion {
    pub region_id: RegionId,
    pub region_code: String,
    pub region_name: String,
    /// Served by this control plane rather than an external relay
    #[serde(default)]
    pub embedded_relay: bool,
    pub nodes: Vec<RelayNode>,
}

/// Relay topology keyed by region id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct RelayMap {
    pub regions: BTreeMap<RegionId, RelayRegion>,
}

impl RelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a list of regions, keyed by their own ids
    pub fn from_regions(regions: impl IntoIterator<Item = RelayRegion>) -> Self {
        Self {
            regions: regions
                .into_iter()
                .map(|region| (region.region_id, region))
                .collect(),
        }
    }

    /// Largest region id present, if any
    pub fn max_region_id(&self) -> Option<RegionId> {
        self.regions.keys().next_back().copied()
    }

    pub fn contains_region_id(&self, region_id: RegionId) -> bool {
        self.regions.contains_key(&region_id)
            || self.regions.values().any(|r| r.region_id == region_id)
    }

    pub fn contains_region_code(&self, region_code: &str) -> bool {
        self.regions.values().any(|r| r.region_code == region_code)
    }

    /// Insert a region under its id, returning the region it replaced
    pub fn insert(&mut self, region: RelayRegion) -> Option<RelayRegion> {
        self.regions.insert(region.region_id, region)
    }

    pub fn region_by_code(&self, region_code: &str) -> Option<&RelayRegion> {
        self.regions.values().find(|r| r.region_code == region_code)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
