//! Licensed feature entitlements

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Licensable features
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    UserLimit,
    AuditLog,
    BrowserOnly,
    Scim,
    TemplateRbac,
    HighAvailability,
    MultipleGitAuth,
    ExternalProvisionerDaemons,
    AdvancedTemplateScheduling,
    WorkspaceProxy,
}

impl FeatureName {
    pub const ALL: [FeatureName; 10] = [
        FeatureName::UserLimit,
        FeatureName::AuditLog,
        FeatureName::BrowserOnly,
        FeatureName::Scim,
        FeatureName::TemplateRbac,
        FeatureName::HighAvailability,
        FeatureName::MultipleGitAuth,
        FeatureName::ExternalProvisionerDaemons,
        FeatureName::AdvancedTemplateScheduling,
        FeatureName::WorkspaceProxy,
    ];

    /// Wire name as used in license claims
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::UserLimit => "user_limit",
            FeatureName::AuditLog => "audit_log",
            FeatureName::BrowserOnly => "browser_only",
            FeatureName::Scim => "scim",
            FeatureName::TemplateRbac => "template_rbac",
            FeatureName::HighAvailability => "high_availability",
            FeatureName::MultipleGitAuth => "multiple_git_auth",
            FeatureName::ExternalProvisionerDaemons => "external_provisioner_daemons",
            FeatureName::AdvancedTemplateScheduling => "advanced_template_scheduling",
            FeatureName::WorkspaceProxy => "workspace_proxy",
        }
    }

    /// Enabled whenever entitled, regardless of deployment configuration
    pub fn always_enable(&self) -> bool {
        matches!(
            self,
            FeatureName::MultipleGitAuth | FeatureName::ExternalProvisionerDaemons
        )
    }

    /// Name shown in operator-facing warnings
    pub fn humanize(&self) -> &'static str {
        match self {
            FeatureName::UserLimit => "User limit",
            FeatureName::AuditLog => "Audit logging",
            FeatureName::BrowserOnly => "Browser only connections",
            FeatureName::Scim => "SCIM",
            FeatureName::TemplateRbac => "Template RBAC",
            FeatureName::HighAvailability => "High availability",
            FeatureName::MultipleGitAuth => "Multiple git authentication",
            FeatureName::ExternalProvisionerDaemons => "External provisioner daemons",
            FeatureName::AdvancedTemplateScheduling => "Advanced template scheduling",
            FeatureName::WorkspaceProxy => "Workspace proxy",
        }
    }
}

impl std::fmt::Display for FeatureName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl std::str::FromStr for FeatureName {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// Entitlement level, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum Entitlement {
    #[default]
    NotEntitled,
    /// Licensed, but the license is past its expiry and inside the grace window
    GracePeriod,
    Entitled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Feature {
    pub entitlement: Entitlement,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<i64>,
}

/// Snapshot published after each license resync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Entitlements {
    pub features: BTreeMap<FeatureName, Feature>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub has_license: bool,
    pub trial: bool,
    pub require_telemetry: bool,
    pub refreshed_at: DateTime<Utc>,
}

impl Default for Entitlements {
    fn default() -> Self {
        Self {
            features: FeatureName::ALL
                .into_iter()
                .map(|name| (name, Feature::default()))
                .collect(),
            warnings: vec![],
            errors: vec![],
            has_license: false,
            trial: false,
            require_telemetry: false,
            refreshed_at: Utc::now(),
        }
    }
}

impl Entitlements {
    pub fn feature(&self, name: FeatureName) -> Feature {
        self.features.get(&name).cloned().unwrap_or_default()
    }

    pub fn enabled(&self, name: FeatureName) -> bool {
        self.features.get(&name).is_some_and(|f| f.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_names_round_trip_through_str() {
        for name in FeatureName::ALL {
            assert_eq!(name.as_str().parse::<FeatureName>(), Ok(name));
            assert_eq!(
                serde_json::to_value(name).unwrap(),
                serde_json::Value::String(name.as_str().to_string())
            );
        }
        assert!("warp_drive".parse::<FeatureName>().is_err());
    }

    #[test]
    fn test_entitlement_ordering() {
        assert!(Entitlement::Entitled > Entitlement::GracePeriod);
        assert!(Entitlement::GracePeriod > Entitlement::NotEntitled);
        assert_eq!(
            Entitlement::NotEntitled.max(Entitlement::GracePeriod),
            Entitlement::GracePeriod
        );
    }

    #[test]
    fn test_default_snapshot_lists_every_feature_disabled() {
        let snapshot = Entitlements::default();
        assert_eq!(snapshot.features.len(), FeatureName::ALL.len());
        assert!(snapshot.features.values().all(|f| !f.enabled));
        assert!(!snapshot.enabled(FeatureName::HighAvailability));
    }
}
