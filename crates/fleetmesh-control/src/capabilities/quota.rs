//! Workspace quota enforcement

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub daily_cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub permitted: bool,
    pub credits_consumed: i64,
    pub budget: i64,
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait QuotaCommitter: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn commit(&self, request: &QuotaRequest) -> Result<QuotaDecision, QuotaError>;
}

/// Permits every build
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaCommitter for UnlimitedQuota {
    fn kind(&self) -> &'static str {
        "unlimited"
    }

    async fn commit(&self, _request: &QuotaRequest) -> Result<QuotaDecision, QuotaError> {
        Ok(QuotaDecision {
            permitted: true,
            credits_consumed: 0,
            budget: 0,
        })
    }
}

/// Rejects builds that would push the owner past their allowance
pub struct EnforcingQuota {
    store: Arc<dyn Store>,
}

impl EnforcingQuota {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QuotaCommitter for EnforcingQuota {
    fn kind(&self) -> &'static str {
        "enforcing"
    }

    async fn commit(&self, request: &QuotaRequest) -> Result<QuotaDecision, QuotaError> {
        let budget = self.store.quota_allowance(request.user_id).await?;
        let consumed = self
            .store
            .quota_consumed(request.user_id, request.workspace_id)
            .await?
            + request.daily_cost;

        let permitted = consumed <= budget;
        if permitted {
            self.store
                .record_workspace_cost(request.workspace_id, request.user_id, request.daily_cost)
                .await?;
        }

        debug!(
            user_id = %request.user_id,
            workspace_id = %request.workspace_id,
            consumed,
            budget,
            permitted,
            "Quota committed"
        );

        Ok(QuotaDecision {
            permitted,
            credits_consumed: consumed,
            budget,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockStore};

    #[tokio::test]
    async fn test_enforcing_quota_rejects_over_budget() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.set_quota_allowance(user, 10);
        let quota = EnforcingQuota::new(store);

        let first = QuotaRequest {
            user_id: user,
            workspace_id: Uuid::new_v4(),
            daily_cost: 6,
        };
        assert!(quota.commit(&first).await.unwrap().permitted);

        // Rebuilding the same workspace replaces its cost
        assert!(quota.commit(&first).await.unwrap().permitted);

        let second = QuotaRequest {
            workspace_id: Uuid::new_v4(),
            ..first.clone()
        };
        let decision = quota.commit(&second).await.unwrap();
        assert!(!decision.permitted);
        assert_eq!(decision.credits_consumed, 12);
        assert_eq!(decision.budget, 10);
    }

    #[tokio::test]
    async fn test_unlimited_quota_never_touches_storage() {
        let request = QuotaRequest {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            daily_cost: i64::MAX,
        };
        assert!(UnlimitedQuota.commit(&request).await.unwrap().permitted);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let mut store = MockStore::new();
        store
            .expect_quota_allowance()
            .returning(|_| Err(StoreError::Unavailable("db down".to_string())));

        let quota = EnforcingQuota::new(Arc::new(store));
        let request = QuotaRequest {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            daily_cost: 1,
        };
        assert!(matches!(
            quota.commit(&request).await,
            Err(QuotaError::Store(StoreError::Unavailable(_)))
        ));
    }
}
