//! Tailnet node descriptors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::relay_map::RegionId;

/// Fixed address advertised by agents that predate per-agent addressing
pub const LEGACY_AGENT_IP: Ipv6Addr = Ipv6Addr::new(
    0xfd7a, 0x115c, 0xa1e0, 0x49d6, 0xb259, 0xb7ac, 0xb1b2, 0x48f4,
);

/// What the coordinator knows about an agent's network identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Node {
    pub agent_id: Uuid,
    /// Overlay addresses assigned to the agent
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<String>))]
    pub addresses: Vec<IpAddr>,
    /// Endpoints where the agent accepts direct connections
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<String>))]
    pub endpoints: Vec<SocketAddr>,
    /// Home relay region
    #[serde(default)]
    pub preferred_region: RegionId,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// An agent with no addresses, or only the shared legacy address, must
    /// be reached through the legacy connection path
    pub fn is_legacy(&self) -> bool {
        self.addresses
            .iter()
            .all(|addr| *addr == IpAddr::V6(LEGACY_AGENT_IP))
    }
}
