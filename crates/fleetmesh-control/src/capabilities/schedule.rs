//! Template scheduling storage

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::store::{Store, StoreResult};

/// Autostart and autostop policy for workspaces built from a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSchedule {
    pub default_ttl_secs: u64,
    /// Zero means no hard limit
    pub max_ttl_secs: u64,
    pub user_autostart_enabled: bool,
    pub user_autostop_enabled: bool,
}

impl Default for TemplateSchedule {
    fn default() -> Self {
        Self {
            default_ttl_secs: 0,
            max_ttl_secs: 0,
            user_autostart_enabled: true,
            user_autostop_enabled: true,
        }
    }
}

#[async_trait]
pub trait TemplateScheduleStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn get(&self, template_id: Uuid) -> StoreResult<TemplateSchedule>;

    /// Persist `schedule` and return what was actually stored
    async fn set(&self, template_id: Uuid, schedule: TemplateSchedule)
        -> StoreResult<TemplateSchedule>;
}

/// Only the default TTL is honoured; users may always toggle autostart and
/// autostop
pub struct BasicScheduleStore {
    store: Arc<dyn Store>,
}

impl BasicScheduleStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TemplateScheduleStore for BasicScheduleStore {
    fn kind(&self) -> &'static str {
        "basic"
    }

    async fn get(&self, template_id: Uuid) -> StoreResult<TemplateSchedule> {
        let stored = self
            .store
            .template_schedule(template_id)
            .await?
            .unwrap_or_default();
        Ok(TemplateSchedule {
            default_ttl_secs: stored.default_ttl_secs,
            ..TemplateSchedule::default()
        })
    }

    async fn set(
        &self,
        template_id: Uuid,
        schedule: TemplateSchedule,
    ) -> StoreResult<TemplateSchedule> {
        let mut stored = self
            .store
            .template_schedule(template_id)
            .await?
            .unwrap_or_default();
        stored.default_ttl_secs = schedule.default_ttl_secs;
        self.store
            .put_template_schedule(template_id, stored)
            .await?;
        self.get(template_id).await
    }
}

/// Every field is stored and enforced as given
pub struct AdvancedScheduleStore {
    store: Arc<dyn Store>,
}

impl AdvancedScheduleStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TemplateScheduleStore for AdvancedScheduleStore {
    fn kind(&self) -> &'static str {
        "advanced"
    }

    async fn get(&self, template_id: Uuid) -> StoreResult<TemplateSchedule> {
        Ok(self
            .store
            .template_schedule(template_id)
            .await?
            .unwrap_or_default())
    }

    async fn set(
        &self,
        template_id: Uuid,
        schedule: TemplateSchedule,
    ) -> StoreResult<TemplateSchedule> {
        self.store
            .put_template_schedule(template_id, schedule.clone())
            .await?;
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn restrictive() -> TemplateSchedule {
        TemplateSchedule {
            default_ttl_secs: 3600,
            max_ttl_secs: 7200,
            user_autostart_enabled: false,
            user_autostop_enabled: false,
        }
    }

    #[tokio::test]
    async fn test_basic_store_ignores_advanced_fields() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let basic = BasicScheduleStore::new(Arc::clone(&store));
        let template = Uuid::new_v4();

        let stored = basic.set(template, restrictive()).await.unwrap();

        assert_eq!(stored.default_ttl_secs, 3600);
        assert_eq!(stored.max_ttl_secs, 0);
        assert!(stored.user_autostart_enabled);
        assert!(stored.user_autostop_enabled);
    }

    #[tokio::test]
    async fn test_advanced_store_keeps_everything() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let advanced = AdvancedScheduleStore::new(Arc::clone(&store));
        let template = Uuid::new_v4();

        advanced.set(template, restrictive()).await.unwrap();
        assert_eq!(advanced.get(template).await.unwrap(), restrictive());

        // Downgrading hides the advanced fields without losing the TTL
        let basic = BasicScheduleStore::new(store);
        assert_eq!(basic.get(template).await.unwrap().default_ttl_secs, 3600);
        assert_eq!(basic.get(template).await.unwrap().max_ttl_secs, 0);
    }
}
