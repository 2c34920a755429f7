//! Raw usage record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One metered API invocation.
///
/// Immutable once built; ownership moves from the middleware to the tracker
/// queue and from there to the repository in a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub eco_id: String,
    pub endpoint: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: i64,
    pub status_code: u16,
    pub api_key_id: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl UsageRecord {
    /// Create a record stamped with the current time and no optional metadata.
    pub fn new(
        eco_id: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status_code: u16,
        response_time_ms: i64,
    ) -> Self {
        Self {
            eco_id: eco_id.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            timestamp: Utc::now(),
            response_time_ms: response_time_ms.max(0),
            status_code,
            api_key_id: None,
            user_agent: None,
            ip_address: None,
        }
    }

    pub fn with_api_key(mut self, api_key_id: Option<String>) -> Self {
        self.api_key_id = api_key_id;
        self
    }

    pub fn with_client(mut self, user_agent: Option<String>, ip_address: Option<String>) -> Self {
        self.user_agent = user_agent;
        self.ip_address = ip_address;
        self
    }
}
