//! Usage plan model and plan-to-quota lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel quota meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Monthly call quota of the free tier.
pub const FREE_PLAN_LIMIT: i64 = 1_000;

/// Monthly call quota of the pro tier; also applied to unrecognised plans.
pub const PRO_PLAN_LIMIT: i64 = 100_000;

/// Plan a tenant is subscribed to.
///
/// Plans are an open set: tenant-specific identifiers are kept verbatim in
/// [`UsagePlan::Custom`] and resolve to the pro quota.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UsagePlan {
    #[default]
    Free,
    Pro,
    Enterprise,
    Custom(String),
}

impl UsagePlan {
    pub fn as_str(&self) -> &str {
        match self {
            UsagePlan::Free => "free",
            UsagePlan::Pro => "pro",
            UsagePlan::Enterprise => "enterprise",
            UsagePlan::Custom(name) => name,
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "free" => UsagePlan::Free,
            "pro" => UsagePlan::Pro,
            "enterprise" => UsagePlan::Enterprise,
            other => UsagePlan::Custom(other.to_string()),
        }
    }

    /// Quota for this plan. Unknown plans get the pro quota.
    pub fn limit(&self) -> i64 {
        match self {
            UsagePlan::Free => FREE_PLAN_LIMIT,
            UsagePlan::Enterprise => UNLIMITED,
            UsagePlan::Pro | UsagePlan::Custom(_) => PRO_PLAN_LIMIT,
        }
    }
}

impl fmt::Display for UsagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for UsagePlan {
    fn from(value: String) -> Self {
        UsagePlan::from_string(&value)
    }
}

impl From<&str> for UsagePlan {
    fn from(value: &str) -> Self {
        UsagePlan::from_string(value)
    }
}

impl From<UsagePlan> for String {
    fn from(value: UsagePlan) -> Self {
        match value {
            UsagePlan::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// Quota for a plan identifier as stored in the subscriptions table.
pub fn resolve_plan_limit(plan: &str) -> i64 {
    UsagePlan::from_string(plan).limit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_plans_map_to_their_quota() {
        assert_eq!(resolve_plan_limit("free"), 1_000);
        assert_eq!(resolve_plan_limit("pro"), 100_000);
        assert_eq!(resolve_plan_limit("enterprise"), UNLIMITED);
    }

    #[test]
    fn unknown_plans_fall_back_to_pro_quota() {
        assert_eq!(resolve_plan_limit("acme-custom"), PRO_PLAN_LIMIT);
        assert_eq!(resolve_plan_limit(""), PRO_PLAN_LIMIT);
        // Matching is exact; casing variants are tenant-specific identifiers.
        assert_eq!(resolve_plan_limit("Free"), PRO_PLAN_LIMIT);
    }

    #[test]
    fn custom_plans_keep_their_identifier() {
        let plan = UsagePlan::from("startup-2024");
        assert_eq!(plan, UsagePlan::Custom("startup-2024".to_string()));
        assert_eq!(plan.to_string(), "startup-2024");
        assert_eq!(serde_json::to_string(&plan).unwrap(), "\"startup-2024\"");
    }

    #[test]
    fn deserializes_from_plain_strings() {
        let plan: UsagePlan = serde_json::from_str("\"enterprise\"").unwrap();
        assert_eq!(plan, UsagePlan::Enterprise);
    }
}
