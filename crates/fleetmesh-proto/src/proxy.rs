//! Edge proxy records and health status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// An operator-registered edge proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct EdgeProxy {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    /// Public URL; empty until the proxy registers itself
    #[serde(default)]
    pub url: String,
    /// Operator-assigned ordinal, added to the relay region offset
    pub region_id: i32,
    #[serde(default)]
    pub relay_enabled: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EdgeProxy {
    pub fn is_registered(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Result of the last health probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealthStatus {
    /// Not probed yet
    #[default]
    Unknown,
    Healthy,
    /// Reachable but reported a failure
    Unhealthy,
    Unreachable,
    /// No URL registered yet
    Unregistered,
}

impl std::fmt::Display for ProxyHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyHealthStatus::Unknown => "unknown",
            ProxyHealthStatus::Healthy => "healthy",
            ProxyHealthStatus::Unhealthy => "unhealthy",
            ProxyHealthStatus::Unreachable => "unreachable",
            ProxyHealthStatus::Unregistered => "unregistered",
        };
        f.write_str(s)
    }
}

/// A proxy together with its latest probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ProxyStatus {
    pub proxy: EdgeProxy,
    pub status: ProxyHealthStatus,
    /// Human-readable probe failures, empty when healthy
    #[serde(default)]
    pub report: Vec<String>,
    pub checked_at: DateTime<Utc>,
}
