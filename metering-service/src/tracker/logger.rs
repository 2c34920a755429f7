use std::error::Error as StdError;

/// Sink for tracker diagnostics. The default forwards to `tracing`.
pub trait UsageLogger: Send + Sync {
    fn error(&self, message: &str, error: &(dyn StdError + 'static));
    fn warn(&self, message: &str);
    fn info(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl UsageLogger for TracingLogger {
    fn error(&self, message: &str, error: &(dyn StdError + 'static)) {
        tracing::error!(component = "usage_tracker", error = %error, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(component = "usage_tracker", "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(component = "usage_tracker", "{}", message);
    }
}
