//! Per-request metering and quota enforcement.
//!
//! [`UsageMetering::run`] wraps a handler: it checks the tenant's quota,
//! short-circuits with 429 for enforced plans that are over limit, records one
//! usage event per request (including rejected and failed ones) and stamps
//! the rate-limit headers on the response.

use super::headers::{apply_rate_limit_headers, format_timestamp};
use super::identity::UsageContext;
use crate::error::{MeteringError, UsageError};
use crate::models::{UsagePlan, UsageRecord, UsageSnapshot};
use crate::services::metrics::record_quota_rejection;
use crate::tracker::UsageTracker;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::middleware::RequestId;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

pub const DEFAULT_UPGRADE_URL: &str = "/dashboard/billing";
pub const QUOTA_EXCEEDED_ERROR: &str = "API limit exceeded";

/// How the middleware reacts to quota state and metering failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringPolicy {
    /// Let requests through when the quota cannot be read.
    pub fail_open: bool,
    /// Plans whose quota is a hard cap. Others proceed with a warning.
    pub enforced_plans: Vec<UsagePlan>,
    /// Sent to rejected callers.
    pub upgrade_url: String,
}

impl Default for MeteringPolicy {
    fn default() -> Self {
        Self {
            fail_open: true,
            enforced_plans: vec![UsagePlan::Free],
            upgrade_url: DEFAULT_UPGRADE_URL.to_string(),
        }
    }
}

impl MeteringPolicy {
    pub fn enforces(&self, plan: &UsagePlan) -> bool {
        self.enforced_plans.contains(plan)
    }
}

/// Body of the 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaExceededBody {
    pub error: String,
    pub message: String,
    pub current_usage: i64,
    pub limit: i64,
    pub period_end: String,
    pub upgrade_url: String,
}

impl QuotaExceededBody {
    pub fn new(snapshot: &UsageSnapshot, upgrade_url: &str) -> Self {
        Self {
            error: QUOTA_EXCEEDED_ERROR.to_string(),
            message: format!(
                "You have exceeded your {} API calls per month limit. Upgrade to Pro for higher limits.",
                snapshot.limit
            ),
            current_usage: snapshot.api_calls,
            limit: snapshot.limit,
            period_end: format_timestamp(&snapshot.period_end),
            upgrade_url: upgrade_url.to_string(),
        }
    }
}

/// Request attributes copied onto the usage record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub endpoint: String,
    pub method: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    /// Set when the request-id middleware ran first. Logged, not stored.
    pub request_id: Option<String>,
}

impl RequestInfo {
    pub fn from_request<B>(request: &axum::http::Request<B>) -> Self {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Self {
            endpoint: request.uri().path().to_string(),
            method: request.method().to_string(),
            user_agent: request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            ip_address: forwarded_for(request.headers()).or(peer),
            request_id: request
                .extensions()
                .get::<RequestId>()
                .map(|RequestId(id)| id.clone()),
        }
    }
}

/// First hop of `X-Forwarded-For`, if any.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Metering around a handler, shared across requests.
#[derive(Clone)]
pub struct UsageMetering {
    tracker: UsageTracker,
    policy: MeteringPolicy,
}

impl UsageMetering {
    pub fn new(tracker: UsageTracker, policy: MeteringPolicy) -> Self {
        Self { tracker, policy }
    }

    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    pub fn policy(&self) -> &MeteringPolicy {
        &self.policy
    }

    /// Run `handler` under metering.
    ///
    /// Requests without a tenant are passed straight through, unrecorded.
    /// Handler errors are recorded as status 500 and returned as
    /// [`MeteringError::Handler`]. Failures of the quota check, of recording a
    /// completed request, or of the header lookup only surface as
    /// [`MeteringError::Usage`] when the policy is fail-closed.
    pub async fn run<H, Fut, E>(
        &self,
        request: Request,
        context: Option<UsageContext>,
        handler: H,
    ) -> Result<Response, MeteringError<E>>
    where
        H: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, E>>,
    {
        let Some(context) = context.filter(|c| !c.eco_id.trim().is_empty()) else {
            tracing::warn!(
                path = %request.uri().path(),
                "No eco_id on request; skipping usage tracking"
            );
            return handler(request).await.map_err(MeteringError::Handler);
        };

        let started = Instant::now();
        let info = RequestInfo::from_request(&request);
        let eco_id = context.eco_id.as_str();

        let check = match self.tracker.check_limit(eco_id).await {
            Ok(check) => Some(check),
            Err(e) => {
                self.tolerate(eco_id, &info, "Failed to check usage limit", e)?;
                None
            }
        };

        if let Some(check) = check.filter(|c| c.exceeded && c.snapshot.limit >= 0) {
            let snapshot = check.snapshot;

            if self.policy.enforces(&snapshot.plan) {
                tracing::info!(
                    eco_id,
                    request_id = info.request_id.as_deref(),
                    plan = %snapshot.plan,
                    api_calls = snapshot.api_calls,
                    limit = snapshot.limit,
                    "Rejecting request over plan quota"
                );
                record_quota_rejection(eco_id, snapshot.plan.as_str());

                let body = QuotaExceededBody::new(&snapshot, &self.policy.upgrade_url);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let status = StatusCode::TOO_MANY_REQUESTS.as_u16();
                if let Err(e) = self.record(&info, &context, status, started).await {
                    tracing::error!(
                        eco_id,
                        request_id = info.request_id.as_deref(),
                        error = %e,
                        "Failed to track rejected request"
                    );
                }
                apply_rate_limit_headers(response.headers_mut(), &snapshot);
                return Ok(response);
            }

            tracing::warn!(
                eco_id,
                request_id = info.request_id.as_deref(),
                plan = %snapshot.plan,
                api_calls = snapshot.api_calls,
                limit = snapshot.limit,
                "Tenant over quota; overage will be billed"
            );
        }

        let mut response = match handler(request).await {
            Ok(response) => response,
            Err(e) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                if let Err(track_err) = self.record(&info, &context, status, started).await {
                    tracing::error!(
                        eco_id,
                        request_id = info.request_id.as_deref(),
                        error = %track_err,
                        "Failed to track failed request"
                    );
                }
                return Err(MeteringError::Handler(e));
            }
        };

        if let Err(e) = self
            .record(&info, &context, response.status().as_u16(), started)
            .await
        {
            self.tolerate(eco_id, &info, "Failed to track usage", e)?;
        }

        match self.tracker.get_current_usage(eco_id).await {
            Ok(snapshot) => apply_rate_limit_headers(response.headers_mut(), &snapshot),
            Err(e) => self.tolerate(
                eco_id,
                &info,
                "Failed to read usage for rate-limit headers",
                e,
            )?,
        }

        Ok(response)
    }

    /// Swallow `err` under fail-open, surface it under fail-closed.
    fn tolerate<E>(
        &self,
        eco_id: &str,
        info: &RequestInfo,
        message: &str,
        err: UsageError,
    ) -> Result<(), MeteringError<E>> {
        let request_id = info.request_id.as_deref();
        if !self.policy.fail_open {
            tracing::error!(eco_id, request_id, error = %err, "{}; failing closed", message);
            return Err(MeteringError::Usage(err));
        }
        tracing::error!(eco_id, request_id, error = %err, "{}; continuing", message);
        Ok(())
    }

    async fn record(
        &self,
        info: &RequestInfo,
        context: &UsageContext,
        status: u16,
        started: Instant,
    ) -> Result<(), UsageError> {
        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        let record = UsageRecord::new(
            context.eco_id.clone(),
            info.endpoint.clone(),
            info.method.clone(),
            status,
            elapsed_ms,
        )
        .with_api_key(context.api_key_id.clone())
        .with_client(info.user_agent.clone(), info.ip_address.clone());

        self.tracker.track(record).await
    }
}

/// Axum adapter for [`UsageMetering::run`].
///
/// Reads the [`UsageContext`] placed by the identity middleware, which must
/// run first.
pub async fn usage_tracking_middleware(
    State(metering): State<UsageMetering>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let context = request.extensions().get::<UsageContext>().cloned();

    metering
        .run(request, context, |request| async move {
            Ok::<_, Infallible>(next.run(request).await)
        })
        .await
        .map_err(|e| match e {
            MeteringError::Usage(e) => AppError::from(e),
            MeteringError::Handler(never) => match never {},
        })
}
