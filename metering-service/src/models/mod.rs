//! Domain models for metering-service.

mod plan;
mod record;
mod snapshot;

pub use plan::{resolve_plan_limit, UsagePlan, FREE_PLAN_LIMIT, PRO_PLAN_LIMIT, UNLIMITED};
pub use record::UsageRecord;
pub use snapshot::{UsageLimitCheck, UsageSnapshot, FALLBACK_PERIOD_DAYS};
