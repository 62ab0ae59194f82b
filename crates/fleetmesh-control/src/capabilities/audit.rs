//! Audit event export

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub actor: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, resource_type: &str, resource_id: impl ToString) -> Self {
        Self {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            actor: None,
            at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

pub trait Auditor: Send + Sync {
    fn kind(&self) -> &'static str;

    fn export(&self, event: &AuditEvent);
}

pub struct NopAuditor;

impl Auditor for NopAuditor {
    fn kind(&self) -> &'static str {
        "nop"
    }

    fn export(&self, _event: &AuditEvent) {}
}

/// Writes audit events to the `fleetmesh::audit` tracing target
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn kind(&self) -> &'static str {
        "tracing"
    }

    fn export(&self, event: &AuditEvent) {
        info!(
            target: "fleetmesh::audit",
            action = %event.action,
            resource_type = %event.resource_type,
            resource_id = %event.resource_id,
            actor = event.actor.as_deref().unwrap_or("system"),
            at = %event.at.to_rfc3339(),
            "audit"
        );
    }
}
