//! Shared storage boundary
//!
//! Every replica reads and writes the same store. Implementations must be
//! safe for concurrent use from many tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetmesh_proto::{EdgeProxy, Replica};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::capabilities::schedule::TemplateSchedule;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An uploaded license
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseRecord {
    pub id: i32,
    pub jwt: String,
    pub uploaded_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_replica(&self, replica: Replica) -> StoreResult<()>;
    async fn replicas_seen_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Replica>>;
    async fn delete_replica(&self, id: Uuid) -> StoreResult<()>;
    /// Returns how many records were removed
    async fn delete_replicas_seen_before(&self, before: DateTime<Utc>) -> StoreResult<usize>;

    /// Non-deleted proxies only
    async fn edge_proxies(&self) -> StoreResult<Vec<EdgeProxy>>;
    async fn edge_proxy(&self, id: Uuid) -> StoreResult<EdgeProxy>;
    async fn upsert_edge_proxy(&self, proxy: EdgeProxy) -> StoreResult<()>;
    async fn delete_edge_proxy(&self, id: Uuid) -> StoreResult<()>;

    async fn licenses(&self) -> StoreResult<Vec<LicenseRecord>>;
    async fn insert_license(&self, jwt: String) -> StoreResult<LicenseRecord>;
    async fn active_user_count(&self) -> StoreResult<i64>;

    async fn quota_allowance(&self, user_id: Uuid) -> StoreResult<i64>;
    /// Sum of daily costs of the user's workspaces other than `excluding`
    async fn quota_consumed(&self, user_id: Uuid, excluding: Uuid) -> StoreResult<i64>;
    async fn record_workspace_cost(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        daily_cost: i64,
    ) -> StoreResult<()>;

    async fn template_schedule(&self, template_id: Uuid) -> StoreResult<Option<TemplateSchedule>>;
    async fn put_template_schedule(
        &self,
        template_id: Uuid,
        schedule: TemplateSchedule,
    ) -> StoreResult<()>;
}

#[derive(Default)]
struct Tables {
    replicas: HashMap<Uuid, Replica>,
    proxies: HashMap<Uuid, EdgeProxy>,
    licenses: Vec<LicenseRecord>,
    active_users: i64,
    allowances: HashMap<Uuid, i64>,
    workspace_costs: HashMap<Uuid, (Uuid, i64)>,
    schedules: HashMap<Uuid, TemplateSchedule>,
}

/// In-process store for single-replica deployments and tests
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_user_count(&self, count: i64) {
        self.write().active_users = count;
    }

    pub fn set_quota_allowance(&self, user_id: Uuid, allowance: i64) {
        self.write().allowances.insert(user_id, allowance);
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_replica(&self, replica: Replica) -> StoreResult<()> {
        self.write().replicas.insert(replica.id, replica);
        Ok(())
    }

    async fn replicas_seen_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Replica>> {
        Ok(self
            .read()
            .replicas
            .values()
            .filter(|r| r.last_seen_at > since)
            .cloned()
            .collect())
    }

    async fn delete_replica(&self, id: Uuid) -> StoreResult<()> {
        self.write().replicas.remove(&id);
        Ok(())
    }

    async fn delete_replicas_seen_before(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut tables = self.write();
        let count = tables.replicas.len();
        tables.replicas.retain(|_, r| r.last_seen_at >= before);
        Ok(count - tables.replicas.len())
    }

    async fn edge_proxies(&self) -> StoreResult<Vec<EdgeProxy>> {
        let mut proxies: Vec<EdgeProxy> = self
            .read()
            .proxies
            .values()
            .filter(|p| !p.deleted)
            .cloned()
            .collect();
        proxies.sort_by_key(|p| p.id);
        Ok(proxies)
    }

    async fn edge_proxy(&self, id: Uuid) -> StoreResult<EdgeProxy> {
        self.read()
            .proxies
            .get(&id)
            .filter(|p| !p.deleted)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_edge_proxy(&self, proxy: EdgeProxy) -> StoreResult<()> {
        let mut tables = self.write();
        let name_taken = tables
            .proxies
            .values()
            .any(|p| p.id != proxy.id && !p.deleted && p.name == proxy.name);
        if name_taken {
            return Err(StoreError::Conflict(format!(
                "proxy name {} already exists",
                proxy.name
            )));
        }
        tables.proxies.insert(proxy.id, proxy);
        Ok(())
    }

    async fn delete_edge_proxy(&self, id: Uuid) -> StoreResult<()> {
        let mut tables = self.write();
        let proxy = tables.proxies.get_mut(&id).ok_or(StoreError::NotFound)?;
        proxy.deleted = true;
        proxy.updated_at = Utc::now();
        Ok(())
    }

    async fn licenses(&self) -> StoreResult<Vec<LicenseRecord>> {
        Ok(self.read().licenses.clone())
    }

    async fn insert_license(&self, jwt: String) -> StoreResult<LicenseRecord> {
        let mut tables = self.write();
        let record = LicenseRecord {
            id: tables.licenses.len() as i32 + 1,
            jwt,
            uploaded_at: Utc::now(),
        };
        tables.licenses.push(record.clone());
        Ok(record)
    }

    async fn active_user_count(&self) -> StoreResult<i64> {
        Ok(self.read().active_users)
    }

    async fn quota_allowance(&self, user_id: Uuid) -> StoreResult<i64> {
        Ok(self.read().allowances.get(&user_id).copied().unwrap_or(0))
    }

    async fn quota_consumed(&self, user_id: Uuid, excluding: Uuid) -> StoreResult<i64> {
        Ok(self
            .read()
            .workspace_costs
            .iter()
            .filter(|(workspace, (owner, _))| **workspace != excluding && *owner == user_id)
            .map(|(_, (_, cost))| cost)
            .sum())
    }

    async fn record_workspace_cost(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        daily_cost: i64,
    ) -> StoreResult<()> {
        self.write()
            .workspace_costs
            .insert(workspace_id, (user_id, daily_cost));
        Ok(())
    }

    async fn template_schedule(&self, template_id: Uuid) -> StoreResult<Option<TemplateSchedule>> {
        Ok(self.read().schedules.get(&template_id).cloned())
    }

    async fn put_template_schedule(
        &self,
        template_id: Uuid,
        schedule: TemplateSchedule,
    ) -> StoreResult<()> {
        self.write().schedules.insert(template_id, schedule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn replica(last_seen_at: DateTime<Utc>) -> Replica {
        Replica {
            id: Uuid::new_v4(),
            hostname: "replica".to_string(),
            relay_address: String::new(),
            region_id: 999,
            started_at: last_seen_at,
            last_seen_at,
            is_self: false,
        }
    }

    #[tokio::test]
    async fn test_replica_freshness_queries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let fresh = replica(now);
        let stale = replica(now - Duration::hours(2));
        store.upsert_replica(fresh.clone()).await.unwrap();
        store.upsert_replica(stale.clone()).await.unwrap();

        let seen = store
            .replicas_seen_since(now - Duration::seconds(15))
            .await
            .unwrap();
        assert_eq!(seen, vec![fresh.clone()]);

        let removed = store
            .delete_replicas_seen_before(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store
                .replicas_seen_since(now - Duration::days(1))
                .await
                .unwrap(),
            vec![fresh]
        );
    }

    #[tokio::test]
    async fn test_deleted_proxies_are_hidden() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let proxy = EdgeProxy {
            id: Uuid::new_v4(),
            name: "paris".to_string(),
            display_name: "Paris".to_string(),
            url: String::new(),
            region_id: 1,
            relay_enabled: true,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        store.upsert_edge_proxy(proxy.clone()).await.unwrap();
        assert_eq!(store.edge_proxies().await.unwrap().len(), 1);

        let duplicate = EdgeProxy {
            id: Uuid::new_v4(),
            ..proxy.clone()
        };
        assert!(matches!(
            store.upsert_edge_proxy(duplicate).await,
            Err(StoreError::Conflict(_))
        ));

        store.delete_edge_proxy(proxy.id).await.unwrap();
        assert!(store.edge_proxies().await.unwrap().is_empty());
        assert_eq!(
            store.edge_proxy(proxy.id).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_quota_consumption_excludes_workspace() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.record_workspace_cost(a, user, 10).await.unwrap();
        store.record_workspace_cost(b, user, 5).await.unwrap();
        store
            .record_workspace_cost(Uuid::new_v4(), Uuid::new_v4(), 100)
            .await
            .unwrap();

        assert_eq!(store.quota_consumed(user, a).await.unwrap(), 5);
        assert_eq!(store.quota_consumed(user, Uuid::nil()).await.unwrap(), 15);
    }
}
