//! Billing-period usage snapshot.

use super::plan::{UsagePlan, FREE_PLAN_LIMIT};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Length of the synthetic period used before a tenant has a subscription.
pub const FALLBACK_PERIOD_DAYS: i64 = 30;

/// A tenant's usage state for its current billing period.
///
/// Always read fresh from the repository (or synthesised); never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub eco_id: String,
    pub plan: UsagePlan,
    /// Call quota for the period; negative means unlimited.
    pub limit: i64,
    pub api_calls: i64,
    pub overage_calls: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl UsageSnapshot {
    /// Free-plan snapshot with zero usage and a period anchored at `now`.
    pub fn free_default(eco_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            eco_id: eco_id.into(),
            plan: UsagePlan::Free,
            limit: FREE_PLAN_LIMIT,
            api_calls: 0,
            overage_calls: 0,
            period_start: now,
            period_end: now + Duration::days(FALLBACK_PERIOD_DAYS),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit < 0
    }

    pub fn is_exceeded(&self) -> bool {
        !self.is_unlimited() && self.api_calls >= self.limit
    }

    /// Calls left in the period, or `None` when unlimited.
    pub fn remaining(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.limit - self.api_calls).max(0))
        }
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimitCheck {
    pub exceeded: bool,
    pub snapshot: UsageSnapshot,
}

impl From<UsageSnapshot> for UsageLimitCheck {
    fn from(snapshot: UsageSnapshot) -> Self {
        Self {
            exceeded: snapshot.is_exceeded(),
            snapshot,
        }
    }
}
