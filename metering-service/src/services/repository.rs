//! Persistence contract the tracker engine depends on.

use crate::error::RepositoryError;
use crate::models::{UsageRecord, UsageSnapshot};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Call counts per tenant for one flushed batch.
pub type TenantCounts = BTreeMap<String, i64>;

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Durably append a batch of raw records, all or nothing, keeping their order.
    /// An empty batch is a no-op.
    async fn save_batch(&self, records: &[UsageRecord]) -> Result<(), RepositoryError>;

    /// Add per-tenant call counts to each tenant's current-period aggregate.
    async fn increment_usage(&self, counts: &TenantCounts) -> Result<(), RepositoryError>;

    /// Latest snapshot for the tenant, or `None` before it has a subscription.
    async fn get_current_usage(
        &self,
        eco_id: &str,
    ) -> Result<Option<UsageSnapshot>, RepositoryError>;

    /// Liveness of the backing store.
    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Count records per tenant.
pub fn count_by_tenant(records: &[UsageRecord]) -> TenantCounts {
    let mut counts = TenantCounts::new();
    for record in records {
        *counts.entry(record.eco_id.clone()).or_insert(0) += 1;
    }
    counts
}
