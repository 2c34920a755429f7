//! Quota response headers.

use crate::models::UsageSnapshot;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::SecondsFormat;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const USAGE_PLAN: HeaderName = HeaderName::from_static("x-usage-plan");

/// Rendered in place of a number for unlimited plans.
pub const UNLIMITED_MARKER: &str = "unlimited";

/// ISO-8601 UTC timestamp with millisecond precision, e.g. `2026-11-01T00:00:00.000Z`.
pub fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, snapshot: &UsageSnapshot) {
    let (limit, remaining) = match snapshot.remaining() {
        Some(remaining) => (
            HeaderValue::from(snapshot.limit),
            HeaderValue::from(remaining),
        ),
        None => (
            HeaderValue::from_static(UNLIMITED_MARKER),
            HeaderValue::from_static(UNLIMITED_MARKER),
        ),
    };

    headers.insert(RATE_LIMIT_LIMIT, limit);
    headers.insert(RATE_LIMIT_REMAINING, remaining);

    if let Ok(reset) = HeaderValue::from_str(&format_timestamp(&snapshot.period_end)) {
        headers.insert(RATE_LIMIT_RESET, reset);
    }

    match HeaderValue::from_str(snapshot.plan.as_str()) {
        Ok(plan) => {
            headers.insert(USAGE_PLAN, plan);
        }
        Err(_) => {
            tracing::warn!(eco_id = %snapshot.eco_id, "Plan name is not a valid header value");
        }
    }
}
