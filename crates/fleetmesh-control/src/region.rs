//! Relay region allocation for edge proxies
//!
//! Each healthy relay-enabled proxy gets its own region, numbered from a
//! starting offset placed well above every region the operator configured:
//! the largest configured id plus a buffer, rounded up to a multiple of the
//! rounding step. The result is deterministic for a given base map and
//! proxy set.

use fleetmesh_proto::{EdgeProxy, RegionId, RelayMap, RelayNode, RelayRegion};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::rate_limit::RateLimitedLog;

pub const REGION_ID_ROUNDING: RegionId = 10_000;
pub const REGION_ID_BUFFER: RegionId = 2_000;
/// Region ids must fit in 32 bits
pub const MAX_REGION_ID: RegionId = (1 << 32) - 1;

const PROXY_REGION_CODE_PREFIX: &str = "coder_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error(
        "Proxy {proxy_name} ({proxy_id}) would take region {region_id}/{region_code}, which is already in use"
    )]
    ProxyConflict {
        proxy_id: Uuid,
        proxy_name: String,
        region_id: RegionId,
        region_code: String,
    },

    #[error("Largest configured region id {largest} exceeds {max}; proxy regions not added")]
    TopologyOverflow { largest: RegionId, max: RegionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub map: RelayMap,
    /// Why any proxy (or the whole allocation) was skipped
    pub skipped: Vec<AllocationError>,
}

/// First id handed out to proxy regions. Never below the rounding step.
/// Saturates for base maps near the top of the id range.
pub fn starting_region_id(base: &RelayMap) -> RegionId {
    let largest = base.max_region_id().unwrap_or(0).max(0);
    let floor = largest.saturating_add(REGION_ID_BUFFER);
    let rounded = match floor % REGION_ID_ROUNDING {
        0 => floor,
        rest => floor.saturating_add(REGION_ID_ROUNDING - rest),
    };
    rounded.max(REGION_ID_ROUNDING)
}

/// Add one region per healthy relay-enabled proxy to a copy of `base`.
///
/// Proxies are taken in id order. A proxy whose computed id or code is
/// already present (in `base` or from an earlier proxy) is skipped.
pub fn allocate(base: &RelayMap, healthy: &[EdgeProxy]) -> Allocation {
    let mut map = base.clone();
    let mut skipped = Vec::new();

    let largest = base.max_region_id().unwrap_or(0);
    if largest > MAX_REGION_ID {
        skipped.push(AllocationError::TopologyOverflow {
            largest,
            max: MAX_REGION_ID,
        });
        return Allocation { map, skipped };
    }
    let start = starting_region_id(base);

    let mut proxies: Vec<&EdgeProxy> = healthy
        .iter()
        .filter(|p| p.relay_enabled && !p.deleted)
        .collect();
    proxies.sort_by_key(|p| p.id);

    for proxy in proxies {
        let region_id = start + RegionId::from(proxy.region_id);
        let Some(node) = proxy_relay_node(proxy, region_id) else {
            continue;
        };
        let region_code = format!("{}{}", PROXY_REGION_CODE_PREFIX, proxy.name.to_lowercase());

        if map.contains_region_id(region_id) || map.contains_region_code(&region_code) {
            skipped.push(AllocationError::ProxyConflict {
                proxy_id: proxy.id,
                proxy_name: proxy.name.clone(),
                region_id,
                region_code,
            });
            continue;
        }

        map.insert(RelayRegion {
            region_id,
            region_code,
            region_name: proxy.name.clone(),
            // Proxies run their own relay
            embedded_relay: false,
            nodes: vec![node],
        });
    }

    Allocation { map, skipped }
}

fn proxy_relay_node(proxy: &EdgeProxy, region_id: RegionId) -> Option<RelayNode> {
    let url = Url::parse(&proxy.url).ok()?;
    let host_name = url.host_str()?.to_string();
    let relay_port = url.port_or_known_default()?;
    Some(RelayNode {
        name: format!("{}a", region_id),
        region_id,
        host_name,
        relay_port,
        stun_port: -1,
        force_plaintext: url.scheme() == "http",
    })
}

/// Runs [`allocate`] and reports skipped proxies through the shared
/// rate-limited warning log
#[derive(Clone)]
pub struct RegionAllocator {
    warnings: Arc<RateLimitedLog>,
}

impl RegionAllocator {
    pub fn new(warnings: Arc<RateLimitedLog>) -> Self {
        Self { warnings }
    }

    pub fn augment(&self, base: &RelayMap, healthy: &[EdgeProxy]) -> RelayMap {
        let allocation = allocate(base, healthy);
        for skipped in &allocation.skipped {
            if self.warnings.allow() {
                warn!(error = %skipped, "Skipping proxy relay region");
            }
        }
        allocation.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_region(id: RegionId, code: &str) -> RelayRegion {
        RelayRegion {
            region_id: id,
            region_code: code.to_string(),
            region_name: code.to_string(),
            embedded_relay: true,
            nodes: vec![],
        }
    }

    fn proxy(name: &str, region_id: i32, url: &str) -> EdgeProxy {
        let now = Utc::now();
        EdgeProxy {
            id: Uuid::new_v4(),
            name: name.to_string(),
            display_name: name.to_uppercase(),
            url: url.to_string(),
            region_id,
            relay_enabled: true,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_starting_region_id() {
        assert_eq!(starting_region_id(&RelayMap::new()), 10_000);
        assert_eq!(
            starting_region_id(&RelayMap::from_regions([base_region(999, "coder")])),
            10_000
        );
        assert_eq!(
            starting_region_id(&RelayMap::from_regions([base_region(9_000, "a")])),
            20_000
        );
        assert_eq!(
            starting_region_id(&RelayMap::from_regions([base_region(18_000, "a")])),
            20_000
        );
        assert_eq!(
            starting_region_id(&RelayMap::from_regions([base_region(18_001, "a")])),
            30_000
        );
    }

    #[test]
    fn test_starting_region_id_saturates_at_top_of_range() {
        let base = RelayMap::from_regions([base_region(RegionId::MAX - 5, "edge")]);
        assert_eq!(starting_region_id(&base), RegionId::MAX);
    }

    #[test]
    fn test_single_proxy_region() {
        let base = RelayMap::from_regions([base_region(999, "coder")]);
        let paris = proxy("Paris", 1, "https://paris.example.com");

        let allocation = allocate(&base, std::slice::from_ref(&paris));

        assert!(allocation.skipped.is_empty());
        assert_eq!(allocation.map.len(), 2);
        let region = &allocation.map.regions[&10_001];
        assert_eq!(region.region_code, "coder_paris");
        assert_eq!(region.region_name, "Paris");
        assert!(!region.embedded_relay);
        assert_eq!(region.nodes.len(), 1);
        let node = &region.nodes[0];
        assert_eq!(node.name, "10001a");
        assert_eq!(node.region_id, 10_001);
        assert_eq!(node.host_name, "paris.example.com");
        assert_eq!(node.relay_port, 443);
        assert_eq!(node.stun_port, -1);
        assert!(!node.force_plaintext);
    }

    #[test]
    fn test_plain_http_proxy_forces_plaintext() {
        let allocation = allocate(
            &RelayMap::new(),
            &[proxy("local", 3, "http://127.0.0.1:3001")],
        );
        let node = &allocation.map.regions[&10_003].nodes[0];
        assert_eq!(node.relay_port, 3001);
        assert!(node.force_plaintext);
    }

    #[test]
    fn test_base_map_is_preserved_and_not_mutated() {
        let base = RelayMap::from_regions([base_region(1, "nyc"), base_region(2, "sfo")]);
        let snapshot = base.clone();

        let allocation = allocate(
            &base,
            &[proxy("a", 1, "https://a.example.com"), proxy("b", 2, "https://b.example.com")],
        );

        assert_eq!(base, snapshot);
        for (id, region) in &base.regions {
            assert_eq!(allocation.map.regions.get(id), Some(region));
        }
        let added: Vec<RegionId> = allocation
            .map
            .regions
            .keys()
            .copied()
            .filter(|id| !base.regions.contains_key(id))
            .collect();
        assert_eq!(added, vec![10_001, 10_002]);
        assert!(added.iter().all(|id| *id > 2));
    }

    #[test]
    fn test_conflicting_code_is_skipped() {
        let base = RelayMap::from_regions([base_region(999, "coder_paris")]);
        let allocation = allocate(&base, &[proxy("Paris", 1, "https://paris.example.com")]);

        assert_eq!(allocation.map, base);
        assert!(matches!(
            allocation.skipped.as_slice(),
            [AllocationError::ProxyConflict { region_id: 10_001, .. }]
        ));
    }

    #[test]
    fn test_colliding_proxies_keep_first_in_id_order() {
        let mut first = proxy("a", 5, "https://a.example.com");
        let mut second = proxy("b", 5, "https://b.example.com");
        first.id = Uuid::from_u128(1);
        second.id = Uuid::from_u128(2);

        // Input order must not matter
        let allocation = allocate(&RelayMap::new(), &[second.clone(), first.clone()]);

        assert_eq!(allocation.map.regions[&10_005].region_code, "coder_a");
        assert_eq!(allocation.skipped.len(), 1);
    }

    #[test]
    fn test_overflowing_topology_adds_nothing() {
        let base = RelayMap::from_regions([base_region(MAX_REGION_ID + 1, "huge")]);
        let allocation = allocate(&base, &[proxy("a", 1, "https://a.example.com")]);

        assert_eq!(allocation.map, base);
        assert!(matches!(
            allocation.skipped.as_slice(),
            [AllocationError::TopologyOverflow { .. }]
        ));
    }

    #[test]
    fn test_ineligible_proxies_are_ignored() {
        let mut disabled = proxy("off", 1, "https://off.example.com");
        disabled.relay_enabled = false;
        let unparseable = proxy("bad", 2, "not a url");

        let allocation = allocate(&RelayMap::new(), &[disabled, unparseable]);

        assert!(allocation.map.is_empty());
        assert!(allocation.skipped.is_empty());
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let base = RelayMap::from_regions([base_region(999, "coder")]);
        let proxies = vec![
            proxy("x", 1, "https://x.example.com"),
            proxy("y", 2, "https://y.example.com"),
        ];
        assert_eq!(allocate(&base, &proxies), allocate(&base, &proxies));
    }
}
