//! Buffered usage pipeline.
//!
//! [`UsageTracker`] takes usage records off the request path: `track` appends
//! to an in-memory FIFO queue and returns, and batches are written through the
//! [`UsageRepository`] when the queue reaches `batch_size`, when the background
//! timer fires, or when `flush`/`shutdown` is called.
//!
//! A flush swaps the whole queue out for an empty one, so producers keep
//! enqueueing while the batch is persisted. Only one flush runs at a time;
//! callers arriving while it is in flight wait on the same result. Persisting
//! runs on its own task and completes even if every waiter goes away.
//!
//! Failure handling is asymmetric:
//! - `save_batch` failed: nothing was stored, so the batch is put back at the
//!   front of the queue and retried with the next flush.
//! - `increment_usage` failed: the raw records are already stored, so the
//!   batch is not requeued (re-saving would duplicate them) and the counters
//!   for that batch are lost.

mod logger;
mod options;

pub use logger::{TracingLogger, UsageLogger};
pub use options::{
    TrackerOptions, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_MAX_QUEUE_SIZE,
    MIN_FLUSH_INTERVAL_MS,
};

use crate::error::UsageError;
use crate::models::{UsageLimitCheck, UsageRecord, UsageSnapshot};
use crate::services::metrics::{record_flush, record_usage_dropped, record_usage_tracked};
use crate::services::repository::{count_by_tenant, UsageRepository};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type PendingFlush = Shared<BoxFuture<'static, Result<(), UsageError>>>;

/// Point-in-time view of the pipeline, for health endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerDiagnostics {
    pub queue_size: usize,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub flush_in_flight: bool,
    pub timer_running: bool,
}

struct QueueState {
    queue: VecDeque<UsageRecord>,
    in_flight: Option<PendingFlush>,
    last_flush_at: Option<DateTime<Utc>>,
}

struct TrackerInner {
    repository: Arc<dyn UsageRepository>,
    options: TrackerOptions,
    logger: Arc<dyn UsageLogger>,
    state: Mutex<QueueState>,
    timer: Mutex<Option<CancellationToken>>,
}

/// Shared handle to one tracker engine. Clones refer to the same queue.
#[derive(Clone)]
pub struct UsageTracker {
    inner: Arc<TrackerInner>,
}

impl UsageTracker {
    /// Build a tracker logging through `tracing`.
    ///
    /// With `auto_start` set (the default) this spawns the flush timer and so
    /// must be called from within a Tokio runtime.
    pub fn new(repository: Arc<dyn UsageRepository>, options: TrackerOptions) -> Self {
        Self::with_logger(repository, options, Arc::new(TracingLogger))
    }

    pub fn with_logger(
        repository: Arc<dyn UsageRepository>,
        options: TrackerOptions,
        logger: Arc<dyn UsageLogger>,
    ) -> Self {
        let options = options.normalized();
        let auto_start = options.auto_start;

        let tracker = Self {
            inner: Arc::new(TrackerInner {
                repository,
                options,
                logger,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    in_flight: None,
                    last_flush_at: None,
                }),
                timer: Mutex::new(None),
            }),
        };

        if auto_start {
            tracker.start();
        }

        tracker
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.inner.options
    }

    pub fn repository(&self) -> &Arc<dyn UsageRepository> {
        &self.inner.repository
    }

    /// Start the periodic flush timer. No-op if already running.
    ///
    /// The timer only holds a weak reference, so it never keeps the tracker
    /// alive and ends once the last handle is dropped.
    pub fn start(&self) {
        let mut timer = self.inner.lock_timer();
        if timer.is_some() {
            return;
        }

        let token = CancellationToken::new();
        spawn_flush_timer(
            Arc::downgrade(&self.inner),
            self.inner.options.flush_interval(),
            token.clone(),
        );
        *timer = Some(token);
    }

    /// Stop the periodic flush timer. No-op if not running.
    pub fn stop(&self) {
        if let Some(token) = self.inner.lock_timer().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_timer().is_some()
    }

    /// Stop the timer and flush until the queue is empty.
    ///
    /// Lost counters do not stop the drain; the first error is returned once
    /// the queue is empty. A failed `save_batch` ends it early with those
    /// records back in the queue.
    pub async fn shutdown(&self) -> Result<(), UsageError> {
        self.stop();

        let mut first_error = None;
        loop {
            match self.flush().await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Err(first_error.unwrap_or(e)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }

            if self.inner.lock_state().queue.is_empty() {
                break;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.inner.logger.info("Usage tracker shut down with empty queue");
                Ok(())
            }
        }
    }

    pub fn diagnostics(&self) -> TrackerDiagnostics {
        let timer_running = self.is_running();
        let state = self.inner.lock_state();
        TrackerDiagnostics {
            queue_size: state.queue.len(),
            last_flush_at: state.last_flush_at,
            flush_in_flight: state.in_flight.is_some(),
            timer_running,
        }
    }

    /// Queue a record; flushes inline once the queue reaches `batch_size`.
    ///
    /// Records without a tenant id are dropped. When the queue exceeds
    /// `max_queue_size` the oldest records are discarded.
    pub async fn track(&self, record: UsageRecord) -> Result<(), UsageError> {
        if record.eco_id.trim().is_empty() {
            self.inner
                .logger
                .warn("Dropping usage record without eco_id");
            return Ok(());
        }

        record_usage_tracked(&record.eco_id);

        let max_queue_size = self.inner.options.max_queue_size;
        let (dropped, batch_ready) = {
            let mut state = self.inner.lock_state();
            state.queue.push_back(record);

            let dropped = state.queue.len().saturating_sub(max_queue_size);
            if dropped > 0 {
                state.queue.drain(..dropped);
            }

            (dropped, state.queue.len() >= self.inner.options.batch_size)
        };

        if dropped > 0 {
            record_usage_dropped(dropped);
            self.inner.logger.warn(&format!(
                "Dropped {} usage records because queue exceeded {}",
                dropped, max_queue_size
            ));
        }

        if batch_ready {
            self.flush().await?;
        }

        Ok(())
    }

    /// Persist everything queued so far.
    ///
    /// If a flush is already running, waits for that one instead of starting
    /// another; records queued meanwhile go out with the next flush.
    pub async fn flush(&self) -> Result<(), UsageError> {
        let pending = {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;

            if let Some(pending) = state.in_flight.clone() {
                pending
            } else if state.queue.is_empty() {
                return Ok(());
            } else {
                let batch: Vec<UsageRecord> = std::mem::take(&mut state.queue).into();
                let pending = spawn_flush(Arc::clone(&self.inner), batch);
                state.in_flight = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Current snapshot, or a zero-usage free-plan snapshot for tenants the
    /// repository does not know yet.
    pub async fn get_current_usage(&self, eco_id: &str) -> Result<UsageSnapshot, UsageError> {
        let snapshot = self.inner.repository.get_current_usage(eco_id).await?;
        Ok(snapshot.unwrap_or_else(|| UsageSnapshot::free_default(eco_id, Utc::now())))
    }

    /// `exceeded` is `api_calls >= limit`, and always false for unlimited plans.
    pub async fn check_limit(&self, eco_id: &str) -> Result<UsageLimitCheck, UsageError> {
        Ok(self.get_current_usage(eco_id).await?.into())
    }

    pub async fn has_exceeded_limit(&self, eco_id: &str) -> Result<bool, UsageError> {
        Ok(self.check_limit(eco_id).await?.exceeded)
    }

    /// Like [`check_limit`](Self::check_limit) but fails with
    /// [`UsageError::LimitExceeded`] when over quota.
    pub async fn ensure_within_limit(&self, eco_id: &str) -> Result<UsageSnapshot, UsageError> {
        let check = self.check_limit(eco_id).await?;
        if check.exceeded {
            return Err(UsageError::LimitExceeded(Box::new(check.snapshot)));
        }
        Ok(check.snapshot)
    }
}

impl TrackerInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_due(&self) -> bool {
        let state = self.lock_state();
        !state.queue.is_empty() && state.in_flight.is_none()
    }

    async fn run_flush(self: Arc<Self>, batch: Vec<UsageRecord>) -> Result<(), UsageError> {
        let started = Instant::now();
        let result = self.persist_batch(&batch).await;

        let outcome = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let outcome = match &result {
                Ok(()) => {
                    state.last_flush_at = Some(Utc::now());
                    "success"
                }
                Err(err) if err.is_retryable() => {
                    let newer = std::mem::take(&mut state.queue);
                    state.queue = batch.into_iter().chain(newer).collect();
                    "requeued"
                }
                Err(_) => "counters_lost",
            };
            state.in_flight = None;
            outcome
        };

        record_flush(outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn persist_batch(&self, batch: &[UsageRecord]) -> Result<(), UsageError> {
        if batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.repository.save_batch(batch).await {
            self.logger.error("Failed to persist usage batch", &e);
            return Err(UsageError::SaveBatch(e));
        }

        let counts = count_by_tenant(batch);
        if let Err(e) = self.repository.increment_usage(&counts).await {
            self.logger.error(
                "Failed to increment usage counters; batch is stored and will not be requeued",
                &e,
            );
            return Err(UsageError::IncrementUsage(e));
        }

        Ok(())
    }
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = timer.take() {
            token.cancel();
        }
    }
}

fn spawn_flush(inner: Arc<TrackerInner>, batch: Vec<UsageRecord>) -> PendingFlush {
    let weak = Arc::downgrade(&inner);
    let handle = tokio::spawn(inner.run_flush(batch));

    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                // The task never reached its bookkeeping; release the slot.
                if let Some(inner) = weak.upgrade() {
                    inner.lock_state().in_flight = None;
                }
                Err(UsageError::FlushAborted(e.to_string()))
            }
        }
    }
    .boxed()
    .shared()
}

fn spawn_flush_timer(inner: Weak<TrackerInner>, period: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    if !inner.flush_due() {
                        continue;
                    }

                    let logger = Arc::clone(&inner.logger);
                    let tracker = UsageTracker { inner };
                    if let Err(e) = tracker.flush().await {
                        logger.error("Periodic flush failed", &e);
                    }
                }
            }
        }
    });
}
