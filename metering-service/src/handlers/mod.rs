//! HTTP handlers for metering-service.

pub mod health;
pub mod usage;

use crate::middleware::UsageMetering;
use crate::tracker::UsageTracker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub metering: UsageMetering,
}

impl AppState {
    pub fn new(metering: UsageMetering) -> Self {
        Self { metering }
    }

    pub fn tracker(&self) -> &UsageTracker {
        self.metering.tracker()
    }
}
