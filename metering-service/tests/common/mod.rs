//! Test helper module for metering-service integration tests.
//!
//! Provides a scriptable repository, a capturing logger and an in-memory
//! application spawned on a random port.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use metering_service::config::MeteringConfig;
use metering_service::error::RepositoryError;
use metering_service::middleware::MeteringPolicy;
use metering_service::models::{UsagePlan, UsageRecord, UsageSnapshot};
use metering_service::services::{init_metrics, InMemoryUsageRepository, TenantCounts, UsageRepository};
use metering_service::startup::Application;
use metering_service::tracker::{TrackerOptions, UsageLogger, UsageTracker};
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

pub const TEST_ECO_ID: &str = "eco-11111111";
pub const OTHER_ECO_ID: &str = "eco-22222222";

/// Options with the timer off so tests drive flushes explicitly.
pub fn manual_options(batch_size: usize, max_queue_size: usize) -> TrackerOptions {
    TrackerOptions {
        batch_size,
        max_queue_size,
        auto_start: false,
        ..TrackerOptions::default()
    }
}

pub fn record(eco_id: &str, endpoint: &str) -> UsageRecord {
    UsageRecord::new(eco_id, endpoint, "GET", 200, 12)
}

pub fn snapshot(eco_id: &str, plan: UsagePlan, api_calls: i64) -> UsageSnapshot {
    let period_start = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
    UsageSnapshot {
        eco_id: eco_id.to_string(),
        limit: plan.limit(),
        plan,
        api_calls,
        overage_calls: 0,
        period_start,
        period_end: period_start + Duration::days(31),
    }
}

fn injected(context: &str) -> RepositoryError {
    RepositoryError::msg(context, "injected failure")
}

/// Repository double recording every call, with switchable failures.
#[derive(Default)]
pub struct MockUsageRepository {
    saved: Mutex<Vec<Vec<UsageRecord>>>,
    increments: Mutex<Vec<TenantCounts>>,
    snapshots: Mutex<HashMap<String, UsageSnapshot>>,
    save_calls: AtomicUsize,
    fail_save: AtomicBool,
    fail_increment: AtomicBool,
    fail_usage: AtomicBool,
    usage_reads: AtomicUsize,
    fail_usage_after: Mutex<Option<usize>>,
    hold_saves: AtomicBool,
    released: Notify,
}

impl MockUsageRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_snapshot(&self, snapshot: UsageSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.eco_id.clone(), snapshot);
    }

    pub fn fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    pub fn fail_increment(&self, fail: bool) {
        self.fail_increment.store(fail, Ordering::SeqCst);
    }

    pub fn fail_usage(&self, fail: bool) {
        self.fail_usage.store(fail, Ordering::SeqCst);
    }

    /// Serve the first `reads` usage lookups, then fail every later one.
    pub fn fail_usage_after(&self, reads: usize) {
        *self.fail_usage_after.lock().unwrap() = Some(reads);
    }

    pub fn usage_reads(&self) -> usize {
        self.usage_reads.load(Ordering::SeqCst)
    }

    /// Park every `save_batch` call until [`release_saves`](Self::release_saves).
    pub fn hold_saves(&self) {
        self.hold_saves.store(true, Ordering::SeqCst);
    }

    pub fn release_saves(&self) {
        self.hold_saves.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Successfully saved batches, in call order.
    pub fn saved_batches(&self) -> Vec<Vec<UsageRecord>> {
        self.saved.lock().unwrap().clone()
    }

    pub fn saved_records(&self) -> Vec<UsageRecord> {
        self.saved_batches().into_iter().flatten().collect()
    }

    pub fn increments(&self) -> Vec<TenantCounts> {
        self.increments.lock().unwrap().clone()
    }

    /// Yield until `save_batch` has been entered `calls` times.
    pub async fn wait_for_save_calls(&self, calls: usize) {
        while self.save_calls() < calls {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl UsageRepository for MockUsageRepository {
    async fn save_batch(&self, records: &[UsageRecord]) -> Result<(), RepositoryError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);

        while self.hold_saves.load(Ordering::SeqCst) {
            self.released.notified().await;
        }

        if self.fail_save.load(Ordering::SeqCst) {
            return Err(injected("Failed to insert usage records"));
        }
        self.saved.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    async fn increment_usage(&self, counts: &TenantCounts) -> Result<(), RepositoryError> {
        if self.fail_increment.load(Ordering::SeqCst) {
            return Err(injected("Failed to increment usage counters"));
        }
        self.increments.lock().unwrap().push(counts.clone());
        Ok(())
    }

    async fn get_current_usage(
        &self,
        eco_id: &str,
    ) -> Result<Option<UsageSnapshot>, RepositoryError> {
        let read = self.usage_reads.fetch_add(1, Ordering::SeqCst);
        let past_budget = matches!(*self.fail_usage_after.lock().unwrap(), Some(n) if read >= n);
        if past_budget || self.fail_usage.load(Ordering::SeqCst) {
            return Err(injected("Failed to load usage snapshot"));
        }
        Ok(self.snapshots.lock().unwrap().get(eco_id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
}

/// Logger keeping every message for assertions.
#[derive(Default)]
pub struct CapturingLogger {
    entries: Mutex<Vec<(Level, String)>>,
}

impl CapturingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl UsageLogger for CapturingLogger {
    fn error(&self, message: &str, error: &(dyn StdError + 'static)) {
        self.entries
            .lock()
            .unwrap()
            .push((Level::Error, format!("{message}: {error}")));
    }

    fn warn(&self, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((Level::Warn, message.to_string()));
    }

    fn info(&self, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((Level::Info, message.to_string()));
    }
}

pub fn tracker_with(
    repository: Arc<MockUsageRepository>,
    options: TrackerOptions,
) -> (UsageTracker, Arc<CapturingLogger>) {
    let logger = CapturingLogger::new();
    let tracker = UsageTracker::with_logger(repository, options, logger.clone());
    (tracker, logger)
}

/// Application served on a random port over the in-memory repository.
pub struct TestApp {
    pub address: String,
    pub repository: Arc<InMemoryUsageRepository>,
    pub tracker: UsageTracker,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(MeteringPolicy::default()).await
    }

    pub async fn spawn_with(policy: MeteringPolicy) -> Self {
        init_metrics();

        let config = MeteringConfig {
            common: CoreConfig {
                port: 0,
                ..CoreConfig::default()
            },
            service_name: "metering-service".to_string(),
            log_level: "debug".to_string(),
            otlp_endpoint: None,
            database: None,
            tracker: manual_options(100, 1_000),
            policy,
        };

        let repository = Arc::new(InMemoryUsageRepository::new());
        let app = Application::with_repository(config, repository.clone())
            .await
            .expect("Failed to build application");

        let address = format!("http://127.0.0.1:{}", app.port());
        let tracker = app.tracker().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until_stopped(async {
            let _ = stopped.await;
        }));

        Self {
            address,
            repository,
            tracker,
            stop: Some(stop),
            server,
        }
    }

    /// Give `eco_id` a subscription for the current month.
    pub async fn subscribe(&self, eco_id: &str, plan: UsagePlan) {
        let start = Utc::now() - Duration::days(1);
        self.repository
            .set_subscription(eco_id, plan, start, start + Duration::days(30))
            .await;
    }

    /// Stop the server; drains the tracker queue.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server
            .await
            .expect("Server task panicked")
            .expect("Server failed");
    }
}
