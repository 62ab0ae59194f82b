//! Licensed capabilities
//!
//! Each capability has a disabled and an enabled implementation. The
//! entitlement registry swaps between them when the license changes.
//!
//! | Slot         | Feature                      | Disabled            | Enabled                |
//! |--------------|------------------------------|---------------------|------------------------|
//! | coordinator  | high_availability            | MemoryCoordinator   | HaCoordinator          |
//! | quota        | template_rbac                | UnlimitedQuota      | EnforcingQuota         |
//! | schedules    | advanced_template_scheduling | BasicScheduleStore  | AdvancedScheduleStore  |
//! | gate         | browser_only                 | AllowAllGate        | BrowserOnlyGate        |
//! | relay_map    | workspace_proxy              | IdentityAugmenter   | ProxyRegionAugmenter   |
//! | auditor      | audit_log                    | NopAuditor          | TracingAuditor         |

pub mod audit;
pub mod coordinator;
pub mod gate;
pub mod quota;
pub mod relay_map;
pub mod schedule;

use std::sync::Arc;

use crate::slot::CapabilitySlot;
use crate::store::Store;

use audit::{Auditor, NopAuditor};
use coordinator::{Coordinator, MemoryCoordinator};
use gate::{AllowAllGate, ConnectivityGate};
use quota::{QuotaCommitter, UnlimitedQuota};
use relay_map::{IdentityAugmenter, RelayMapAugmenter};
use schedule::{BasicScheduleStore, TemplateScheduleStore};

/// Handles to every capability slot, cheap to clone
#[derive(Clone)]
pub struct Capabilities {
    pub coordinator: Arc<CapabilitySlot<dyn Coordinator>>,
    pub quota: Arc<CapabilitySlot<dyn QuotaCommitter>>,
    pub schedules: Arc<CapabilitySlot<dyn TemplateScheduleStore>>,
    pub gate: Arc<CapabilitySlot<dyn ConnectivityGate>>,
    pub relay_map: Arc<CapabilitySlot<dyn RelayMapAugmenter>>,
    pub auditor: Arc<CapabilitySlot<dyn Auditor>>,
}

impl Capabilities {
    /// Every slot starts with its disabled implementation
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            coordinator: Arc::new(CapabilitySlot::new(
                "coordinator",
                Arc::new(MemoryCoordinator::new()),
            )),
            quota: Arc::new(CapabilitySlot::new("quota", Arc::new(UnlimitedQuota))),
            schedules: Arc::new(CapabilitySlot::new(
                "schedules",
                Arc::new(BasicScheduleStore::new(store)),
            )),
            gate: Arc::new(CapabilitySlot::new("gate", Arc::new(AllowAllGate))),
            relay_map: Arc::new(CapabilitySlot::new("relay_map", Arc::new(IdentityAugmenter))),
            auditor: Arc::new(CapabilitySlot::new("auditor", Arc::new(NopAuditor))),
        }
    }
}
