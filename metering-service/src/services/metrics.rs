//! Metrics module for metering-service.
//! Provides Prometheus metrics for the usage pipeline and quota enforcement,
//! plus the recorder behind the `metrics` facade used by the HTTP middleware.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec,
    TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Usage records accepted into the queue (per-tenant metering)
pub static USAGE_RECORDS_TRACKED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage records dropped because the queue overflowed
pub static USAGE_RECORDS_DROPPED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Flushes by outcome
pub static FLUSH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Flush duration histogram
pub static FLUSH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Requests rejected with 429
pub static QUOTA_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recorder for `service_core` HTTP metrics. `None` if another recorder was
/// already installed in this process.
pub static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder; HTTP metrics disabled");
            None
        }
    });

    USAGE_RECORDS_TRACKED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_records_tracked_total",
                "Total usage records queued by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register USAGE_RECORDS_TRACKED_TOTAL")
    });

    USAGE_RECORDS_DROPPED_TOTAL.get_or_init(|| {
        register_int_counter!(opts!(
            "metering_usage_records_dropped_total",
            "Usage records dropped on queue overflow"
        ))
        .expect("Failed to register USAGE_RECORDS_DROPPED_TOTAL")
    });

    FLUSH_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_flush_total", "Usage batch flushes by outcome"),
            &["outcome"]
        )
        .expect("Failed to register FLUSH_TOTAL")
    });

    FLUSH_DURATION.get_or_init(|| {
        register_histogram!(histogram_opts!(
            "metering_flush_duration_seconds",
            "Time to persist a usage batch and bump counters",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        ))
        .expect("Failed to register FLUSH_DURATION")
    });

    QUOTA_REJECTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_quota_rejections_total",
                "Requests rejected for exceeding plan quota"
            ),
            &["tenant_id", "plan"]
        )
        .expect("Failed to register QUOTA_REJECTIONS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format: the registry's families followed by
/// the HTTP metrics from the facade recorder.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let mut output = match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            String::new()
        }
    };

    if let Some(handle) = METRICS_HANDLE.get().and_then(Option::as_ref) {
        output.push_str(&handle.render());
    }
    output
}

/// Record a usage record entering the queue.
pub fn record_usage_tracked(tenant_id: &str) {
    if let Some(counter) = USAGE_RECORDS_TRACKED_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

/// Record records dropped on overflow.
pub fn record_usage_dropped(count: usize) {
    if let Some(counter) = USAGE_RECORDS_DROPPED_TOTAL.get() {
        counter.inc_by(count as u64);
    }
}

/// Record a finished flush.
pub fn record_flush(outcome: &str, duration_secs: f64) {
    if let Some(counter) = FLUSH_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
    if let Some(histogram) = FLUSH_DURATION.get() {
        histogram.observe(duration_secs);
    }
}

/// Record a 429 quota rejection.
pub fn record_quota_rejection(tenant_id: &str, plan: &str) {
    if let Some(counter) = QUOTA_REJECTIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, plan]).inc();
    }
}
