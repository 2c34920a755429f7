//! Caller identity resolved upstream by the API-key gateway.
//!
//! The gateway verifies the key and forwards the result as headers; this
//! service only trusts them because it is not reachable from outside the
//! gateway. Key verification itself does not happen here.

use axum::async_trait;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use service_core::error::AppError;

pub const ECO_ID_HEADER: &str = "x-eco-id";
pub const API_KEY_ID_HEADER: &str = "x-api-key-id";
pub const SCOPES_HEADER: &str = "x-api-scopes";

/// What the metering middleware needs to attribute a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageContext {
    pub eco_id: String,
    pub api_key_id: Option<String>,
}

impl UsageContext {
    pub fn new(eco_id: impl Into<String>) -> Self {
        Self {
            eco_id: eco_id.into(),
            api_key_id: None,
        }
    }

    pub fn with_api_key(mut self, api_key_id: impl Into<String>) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self
    }
}

/// Full identity as resolved by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub eco_id: String,
    pub api_key_id: Option<String>,
    pub scopes: Vec<String>,
}

impl ResolvedIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let eco_id = header(ECO_ID_HEADER)?;
        let scopes = header(SCOPES_HEADER)
            .map(|raw| {
                raw.split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            eco_id,
            api_key_id: header(API_KEY_ID_HEADER),
            scopes,
        })
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Fail with 403 naming the scopes the caller lacks.
    pub fn require_scopes(&self, required: &[&str]) -> Result<(), AppError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|scope| !self.has_scope(scope))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Insufficient scopes. Required: [{}]",
                missing.join(", ")
            )))
        }
    }

    pub fn usage_context(&self) -> UsageContext {
        UsageContext {
            eco_id: self.eco_id.clone(),
            api_key_id: self.api_key_id.clone(),
        }
    }
}

/// Resolve identity headers into [`ResolvedIdentity`] and [`UsageContext`]
/// request extensions. Requests without identity pass through untouched.
pub async fn identity_middleware(mut req: Request, next: Next) -> Response {
    if let Some(identity) = ResolvedIdentity::from_headers(req.headers()) {
        req.extensions_mut().insert(identity.usage_context());
        req.extensions_mut().insert(identity);
    }

    next.run(req).await
}

#[async_trait]
impl<S> FromRequestParts<S> for ResolvedIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<ResolvedIdentity>() {
            return Ok(identity.clone());
        }

        ResolvedIdentity::from_headers(&parts.headers).ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!(
                "Missing X-Eco-ID header (required from API gateway)"
            ))
        })
    }
}
