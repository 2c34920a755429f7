//! In-process repository for local runs without Postgres.

use super::repository::{TenantCounts, UsageRepository};
use crate::error::RepositoryError;
use crate::models::{UsagePlan, UsageRecord, UsageSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Subscription {
    plan: UsagePlan,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

#[derive(Default)]
struct Store {
    records: Vec<UsageRecord>,
    api_calls: HashMap<String, i64>,
    subscriptions: HashMap<String, Subscription>,
}

/// Keeps raw records and counters in memory. Counters accumulate only for
/// tenants with a subscription, as the Postgres increment function does.
#[derive(Default)]
pub struct InMemoryUsageRepository {
    store: RwLock<Store>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the tenant's current subscription; resets its counter.
    pub async fn set_subscription(
        &self,
        eco_id: &str,
        plan: UsagePlan,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) {
        let mut store = self.store.write().await;
        store.subscriptions.insert(
            eco_id.to_string(),
            Subscription {
                plan,
                period_start,
                period_end,
            },
        );
        store.api_calls.insert(eco_id.to_string(), 0);
    }

    /// Raw records persisted so far, in insertion order.
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.store.read().await.records.clone()
    }

    pub async fn counter(&self, eco_id: &str) -> i64 {
        self.store
            .read()
            .await
            .api_calls
            .get(eco_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn save_batch(&self, records: &[UsageRecord]) -> Result<(), RepositoryError> {
        if records.is_empty() {
            return Ok(());
        }
        self.store
            .write()
            .await
            .records
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn increment_usage(&self, counts: &TenantCounts) -> Result<(), RepositoryError> {
        let mut store = self.store.write().await;
        for (eco_id, count) in counts {
            if store.subscriptions.contains_key(eco_id) {
                *store.api_calls.entry(eco_id.clone()).or_insert(0) += count;
            }
        }
        Ok(())
    }

    async fn get_current_usage(
        &self,
        eco_id: &str,
    ) -> Result<Option<UsageSnapshot>, RepositoryError> {
        let store = self.store.read().await;
        let Some(subscription) = store.subscriptions.get(eco_id) else {
            return Ok(None);
        };

        let limit = subscription.plan.limit();
        let api_calls = store.api_calls.get(eco_id).copied().unwrap_or(0);
        let overage_calls = if limit < 0 {
            0
        } else {
            (api_calls - limit).max(0)
        };

        Ok(Some(UsageSnapshot {
            eco_id: eco_id.to_string(),
            plan: subscription.plan.clone(),
            limit,
            api_calls,
            overage_calls,
            period_start: subscription.period_start,
            period_end: subscription.period_end,
        }))
    }
}
