//! Tenant-facing usage endpoints.

use super::AppState;
use crate::middleware::ResolvedIdentity;
use crate::models::{UsageLimitCheck, UsageSnapshot};
use crate::services::{summarize_overage, OverageSummary};
use axum::{extract::State, Json};
use serde::Serialize;
use service_core::error::AppError;

pub const USAGE_READ_SCOPE: &str = "usage:read";

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(flatten)]
    pub snapshot: UsageSnapshot,
    pub remaining: Option<i64>,
    pub overage: OverageSummary,
}

/// GET /v1/usage
pub async fn get_usage(
    State(state): State<AppState>,
    identity: ResolvedIdentity,
) -> Result<Json<UsageResponse>, AppError> {
    identity.require_scopes(&[USAGE_READ_SCOPE])?;

    let snapshot = state.tracker().get_current_usage(&identity.eco_id).await?;
    let overage = summarize_overage(&snapshot);

    Ok(Json(UsageResponse {
        remaining: snapshot.remaining(),
        overage,
        snapshot,
    }))
}

/// GET /v1/usage/limit
pub async fn get_limit(
    State(state): State<AppState>,
    identity: ResolvedIdentity,
) -> Result<Json<UsageLimitCheck>, AppError> {
    identity.require_scopes(&[USAGE_READ_SCOPE])?;

    let check = state.tracker().check_limit(&identity.eco_id).await?;
    Ok(Json(check))
}
