//! HTTP middleware for metering-service.

pub mod headers;
pub mod identity;
pub mod metering;

pub use headers::apply_rate_limit_headers;
pub use identity::{identity_middleware, ResolvedIdentity, UsageContext};
pub use metering::{
    usage_tracking_middleware, MeteringPolicy, QuotaExceededBody, RequestInfo, UsageMetering,
};
