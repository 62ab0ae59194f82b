//! License-gated control plane for a multi-replica deployment
pub mod backoff;
pub mod capabilities;
pub mod entitlements;
pub mod license;
pub mod mesh;
pub mod proxy_health;
pub mod pubsub;
pub mod rate_limit;
pub mod region;
pub mod replicas;
pub mod slot;
pub mod store;
pub mod tailnet;

pub use backoff::{Backoff, BackoffConfig};
pub use capabilities::audit::{AuditEvent, Auditor, NopAuditor, TracingAuditor};
pub use capabilities::coordinator::{
    Coordinator, CoordinatorError, CoordinatorFactory, HaCoordinator, MemoryCoordinator,
    StandardCoordinatorFactory,
};
pub use capabilities::gate::{AllowAllGate, BrowserOnlyGate, ConnectionOrigin, ConnectivityGate, GateRejection};
pub use capabilities::quota::{QuotaCommitter, QuotaDecision, QuotaError, QuotaRequest};
pub use capabilities::relay_map::{RelayMapAugmenter, RelayMapSource};
pub use capabilities::schedule::{TemplateSchedule, TemplateScheduleStore};
pub use capabilities::Capabilities;
pub use entitlements::{
    Collaborators, ControlOptions, EntitlementRegistry, EntitlementsError, TELEMETRY_REQUIRED_ERROR,
};
pub use license::{sign_license, LicenseClaims, LicenseError, LicenseKeys, PUBSUB_EVENT_LICENSES};
pub use mesh::RelayMesh;
pub use proxy_health::{ProxyHealth, ProxyHealthError, ProxyHealthOptions};
pub use pubsub::{MemoryPubsub, Pubsub, PubsubError, Subscription};
pub use replicas::{ReplicaError, ReplicaManager, ReplicaOptions};
pub use slot::CapabilitySlot;
pub use store::{LicenseRecord, MemoryStore, Store, StoreError, StoreResult};
pub use tailnet::{
    AgentProxy, BrokerError, EphemeralLegacyConns, LegacyConnCache, Lease, ServerTailnet,
    TailnetOptions,
};
