use chrono::{DateTime, Utc};
use fleetmesh_control::{QuotaDecision, TemplateSchedule};
use fleetmesh_proto::{EdgeProxy, ProxyHealthStatus, Replica};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// This replica's id
    pub replica_id: Uuid,
    /// Live replicas, including this one
    pub replicas: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Live replicas
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplicaList {
    pub replicas: Vec<Replica>,
    /// Id of the replica currently considered primary
    pub primary: Uuid,
}

/// Workspace proxy with its latest health probe
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkspaceProxy {
    #[serde(flatten)]
    pub proxy: EdgeProxy,
    pub status: ProxyHealthStatus,
    /// Errors from the last probe
    pub report: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

/// List of workspace proxies
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkspaceProxyList {
    pub proxies: Vec<WorkspaceProxy>,
    pub total: usize,
}

/// Request to create a workspace proxy record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateWorkspaceProxyRequest {
    /// Unique name; becomes part of the relay region code
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Ordinal added to the proxy region offset
    pub region_id: i32,
    #[serde(default = "default_relay_enabled")]
    pub relay_enabled: bool,
}

fn default_relay_enabled() -> bool {
    true
}

/// Sent by a proxy once it knows its public URL
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterWorkspaceProxyRequest {
    pub url: String,
}

/// Template autostart and autostop policy
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TemplateScheduleBody {
    pub default_ttl_secs: u64,
    /// Zero means no hard limit
    #[serde(default)]
    pub max_ttl_secs: u64,
    #[serde(default = "default_user_toggle")]
    pub user_autostart_enabled: bool,
    #[serde(default = "default_user_toggle")]
    pub user_autostop_enabled: bool,
}

fn default_user_toggle() -> bool {
    true
}

impl From<TemplateSchedule> for TemplateScheduleBody {
    fn from(schedule: TemplateSchedule) -> Self {
        Self {
            default_ttl_secs: schedule.default_ttl_secs,
            max_ttl_secs: schedule.max_ttl_secs,
            user_autostart_enabled: schedule.user_autostart_enabled,
            user_autostop_enabled: schedule.user_autostop_enabled,
        }
    }
}

impl From<TemplateScheduleBody> for TemplateSchedule {
    fn from(body: TemplateScheduleBody) -> Self {
        Self {
            default_ttl_secs: body.default_ttl_secs,
            max_ttl_secs: body.max_ttl_secs,
            user_autostart_enabled: body.user_autostart_enabled,
            user_autostop_enabled: body.user_autostop_enabled,
        }
    }
}

/// Cost of a workspace build to charge against its owner's allowance
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuotaCommitRequest {
    pub user_id: Uuid,
    pub daily_cost: i64,
}

/// Outcome of a quota commit
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuotaCommitResponse {
    pub permitted: bool,
    pub credits_consumed: i64,
    pub budget: i64,
}

impl From<QuotaDecision> for QuotaCommitResponse {
    fn from(decision: QuotaDecision) -> Self {
        Self {
            permitted: decision.permitted,
            credits_consumed: decision.credits_consumed,
            budget: decision.budget,
        }
    }
}
