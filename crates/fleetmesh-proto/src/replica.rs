//! Control-plane replica records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::relay_map::RegionId;

/// One running control-plane instance as announced to shared storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Replica {
    pub id: Uuid,
    pub hostname: String,
    /// Relay URL peers use to mesh with this replica; may be empty
    pub relay_address: String,
    pub region_id: RegionId,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Set only on the record describing the local process
    #[serde(default)]
    pub is_self: bool,
}
