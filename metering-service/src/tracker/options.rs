use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;
pub const MIN_FLUSH_INTERVAL_MS: u64 = 100;

/// Tuning knobs for [`UsageTracker`](super::UsageTracker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerOptions {
    /// Queue length that triggers an inline flush.
    pub batch_size: usize,
    /// Period of the background flush timer.
    pub flush_interval_ms: u64,
    /// Queue bound; the oldest records beyond it are dropped.
    pub max_queue_size: usize,
    /// Start the background timer on construction.
    pub auto_start: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            auto_start: true,
        }
    }
}

impl TrackerOptions {
    /// Clamp to the supported floors: batch ≥ 1, interval ≥ 100ms, queue ≥ batch.
    pub fn normalized(self) -> Self {
        let batch_size = self.batch_size.max(1);
        Self {
            batch_size,
            flush_interval_ms: self.flush_interval_ms.max(MIN_FLUSH_INTERVAL_MS),
            max_queue_size: self.max_queue_size.max(batch_size),
            auto_start: self.auto_start,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
