//! Overage view of a usage snapshot, as consumed by the monthly billing job.

use crate::models::{UsagePlan, UsageSnapshot};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

pub const OVERAGE_CURRENCY: &str = "usd";

/// $0.001 per call beyond quota, in cents.
pub fn overage_unit_cost_cents() -> Decimal {
    Decimal::new(1, 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverageSummary {
    pub eco_id: String,
    pub plan: UsagePlan,
    pub overage_calls: i64,
    pub overage_cost_cents: i64,
    /// Only the pro plan is invoiced for overage; free is hard-capped and
    /// enterprise is unlimited.
    pub billable: bool,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: &'static str,
}

/// Cost in whole cents for `overage_calls`, rounded half away from zero.
pub fn overage_cost_cents(overage_calls: i64) -> i64 {
    if overage_calls <= 0 {
        return 0;
    }
    (Decimal::from(overage_calls) * overage_unit_cost_cents())
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(i64::MAX)
}

pub fn summarize_overage(snapshot: &UsageSnapshot) -> OverageSummary {
    let overage_calls = snapshot.overage_calls.max(0);
    let billable = snapshot.plan == UsagePlan::Pro && overage_calls > 0;

    OverageSummary {
        eco_id: snapshot.eco_id.clone(),
        plan: snapshot.plan.clone(),
        overage_calls,
        overage_cost_cents: overage_cost_cents(overage_calls),
        billable,
        period_start: snapshot.period_start,
        period_end: snapshot.period_end,
        currency: OVERAGE_CURRENCY,
    }
}
