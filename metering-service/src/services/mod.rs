//! Services module for metering-service.

pub mod memory;
pub mod metrics;
pub mod overage;
pub mod postgres;
pub mod repository;

pub use memory::InMemoryUsageRepository;
pub use metrics::{
    get_metrics, init_metrics, record_flush, record_quota_rejection, record_usage_dropped,
    record_usage_tracked,
};
pub use overage::{summarize_overage, OverageSummary};
pub use postgres::PgUsageRepository;
pub use repository::{count_by_tenant, TenantCounts, UsageRepository};
