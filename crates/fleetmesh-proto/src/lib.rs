//! Fleetmesh shared data model
//!
//! Types exchanged between the control plane, the HTTP surface and peer
//! replicas: relay topology, replica records, edge proxies, tailnet nodes
//! and the entitlements snapshot.

pub mod entitlements;
pub mod node;
pub mod proxy;
pub mod relay_map;
pub mod replica;

pub use entitlements::{Entitlement, Entitlements, Feature, FeatureName, UnknownFeature};
pub use node::{Node, LEGACY_AGENT_IP};
pub use proxy::{EdgeProxy, ProxyHealthStatus, ProxyStatus};
pub use relay_map::{RegionId, RelayMap, RelayNode, RelayRegion};
pub use replica::Replica;
