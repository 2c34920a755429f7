//! Metering middleware tests driven through `UsageMetering::run`.

mod common;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{manual_options, snapshot, tracker_with, MockUsageRepository, TEST_ECO_ID};
use http_body_util::BodyExt;
use metering_service::error::{MeteringError, UsageError};
use metering_service::middleware::{
    MeteringPolicy, QuotaExceededBody, UsageContext, UsageMetering,
};
use metering_service::models::UsagePlan;
use service_core::error::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn metering(repo: Arc<MockUsageRepository>, policy: MeteringPolicy) -> UsageMetering {
    let (tracker, _) = tracker_with(repo, manual_options(100, 1_000));
    UsageMetering::new(tracker, policy)
}

fn request(path: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("user-agent", "emotion-sdk/2.0")
        .header("x-forwarded-for", "198.51.100.7")
        .body(Body::empty())
        .unwrap()
}

fn context() -> Option<UsageContext> {
    Some(UsageContext::new(TEST_ECO_ID).with_api_key("key-1"))
}

/// Handler answering 200 and counting its invocations.
fn ok_handler(
    calls: &Arc<AtomicUsize>,
) -> impl FnOnce(Request) -> std::future::Ready<Result<Response, &'static str>> {
    let calls = calls.clone();
    move |_req| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(StatusCode::OK.into_response()))
    }
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn free_tenant_at_quota_is_rejected_without_calling_handler() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Free, 1_000));
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/emotions/analyze"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("1000"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    assert_eq!(
        header(&response, "x-ratelimit-reset"),
        Some("2026-11-01T00:00:00.000Z")
    );
    assert_eq!(header(&response, "x-usage-plan"), Some("free"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: QuotaExceededBody = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.error, "API limit exceeded");
    assert_eq!(body.current_usage, 1_000);
    assert_eq!(body.limit, 1_000);
    assert_eq!(body.period_end, "2026-11-01T00:00:00.000Z");
    assert_eq!(body.upgrade_url, "/dashboard/billing");

    metering.tracker().flush().await.unwrap();
    let recorded = repo.saved_records();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status_code, 429);
    assert_eq!(recorded[0].endpoint, "/v1/emotions/analyze");
}

#[tokio::test]
async fn pro_tenant_over_quota_proceeds() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Pro, 150_000));
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/emotions/analyze"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("100000"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    assert_eq!(header(&response, "x-usage-plan"), Some("pro"));
}

#[tokio::test]
async fn enforced_paid_plan_is_rejected() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Pro, 100_000));
    let policy = MeteringPolicy {
        enforced_plans: vec![UsagePlan::Free, UsagePlan::Pro],
        ..MeteringPolicy::default()
    };
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering(repo, policy)
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn success_records_usage_and_sets_headers() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Free, 250));
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/emotions/analyze"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("750"));

    metering.tracker().flush().await.unwrap();
    let recorded = repo.saved_records();
    assert_eq!(recorded.len(), 1);
    let record = &recorded[0];
    assert_eq!(record.eco_id, TEST_ECO_ID);
    assert_eq!(record.method, "POST");
    assert_eq!(record.status_code, 200);
    assert_eq!(record.api_key_id.as_deref(), Some("key-1"));
    assert_eq!(record.user_agent.as_deref(), Some("emotion-sdk/2.0"));
    assert_eq!(record.ip_address.as_deref(), Some("198.51.100.7"));
    assert!(record.response_time_ms >= 0);
}

#[tokio::test]
async fn handler_error_is_recorded_as_500_and_returned() {
    let repo = MockUsageRepository::new();
    let metering = metering(repo.clone(), MeteringPolicy::default());

    let result = metering
        .run(request("/v1/fails"), context(), |_req| async {
            Err::<Response, _>("model backend unavailable")
        })
        .await;

    match result {
        Err(MeteringError::Handler(e)) => assert_eq!(e, "model backend unavailable"),
        other => panic!("expected handler error, got {:?}", other.map(|r| r.status())),
    }

    metering.tracker().flush().await.unwrap();
    let recorded = repo.saved_records();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status_code, 500);
}

#[tokio::test]
async fn fail_open_proceeds_when_usage_is_unavailable() {
    let repo = MockUsageRepository::new();
    repo.fail_usage(true);
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert_eq!(metering.tracker().diagnostics().queue_size, 1);
}

#[tokio::test]
async fn fail_closed_blocks_when_usage_is_unavailable() {
    let repo = MockUsageRepository::new();
    repo.fail_usage(true);
    let policy = MeteringPolicy {
        fail_open: false,
        ..MeteringPolicy::default()
    };
    let metering = metering(repo, policy);
    let calls = Arc::new(AtomicUsize::new(0));

    let err = metering
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let usage = match err {
        MeteringError::Usage(e) => e,
        MeteringError::Handler(e) => panic!("unexpected handler error: {e}"),
    };
    assert!(matches!(usage, UsageError::Repository(_)));
    assert_eq!(
        AppError::from(usage).status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

fn fail_closed() -> MeteringPolicy {
    MeteringPolicy {
        fail_open: false,
        ..MeteringPolicy::default()
    }
}

#[tokio::test]
async fn fail_closed_surfaces_header_lookup_failure_after_handler() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Pro, 10));
    repo.fail_usage_after(1);
    let metering = metering(repo.clone(), fail_closed());
    let calls = Arc::new(AtomicUsize::new(0));

    let err = metering
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(repo.usage_reads(), 2);
    assert!(matches!(
        err,
        MeteringError::Usage(UsageError::Repository(_))
    ));
    assert_eq!(metering.tracker().diagnostics().queue_size, 1);
}

#[tokio::test]
async fn fail_open_omits_headers_when_lookup_fails_after_handler() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Pro, 10));
    repo.fail_usage_after(1);
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(repo.usage_reads(), 2);
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
    assert!(response.headers().get("x-usage-plan").is_none());
}

#[tokio::test]
async fn fail_closed_surfaces_record_failure_after_handler() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Pro, 10));
    repo.fail_save(true);
    let (tracker, _) = tracker_with(repo.clone(), manual_options(1, 1_000));
    let metering = UsageMetering::new(tracker, fail_closed());
    let calls = Arc::new(AtomicUsize::new(0));

    let err = metering
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, MeteringError::Usage(UsageError::SaveBatch(_))));
    assert_eq!(repo.usage_reads(), 1);
    assert_eq!(metering.tracker().diagnostics().queue_size, 1);
}

#[tokio::test]
async fn missing_tenant_skips_metering() {
    let repo = MockUsageRepository::new();
    let metering = metering(repo.clone(), MeteringPolicy::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering
        .run(request("/v1/x"), None, ok_handler(&calls))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(response.headers().get("x-usage-plan").is_none());

    let blank = Some(UsageContext::new(""));
    metering
        .run(request("/v1/x"), blank, ok_handler(&calls))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert_eq!(metering.tracker().diagnostics().queue_size, 0);
}

#[tokio::test]
async fn unlimited_plan_renders_marker_headers() {
    let repo = MockUsageRepository::new();
    repo.set_snapshot(snapshot(TEST_ECO_ID, UsagePlan::Enterprise, 9_000_000));
    let calls = Arc::new(AtomicUsize::new(0));

    let response = metering(repo, MeteringPolicy::default())
        .run(request("/v1/x"), context(), ok_handler(&calls))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("unlimited"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("unlimited"));
    assert_eq!(header(&response, "x-usage-plan"), Some("enterprise"));
}
