//! Configuration module for metering-service.

use crate::middleware::metering::{MeteringPolicy, DEFAULT_UPGRADE_URL};
use crate::models::UsagePlan;
use crate::tracker::{
    TrackerOptions, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_MAX_QUEUE_SIZE,
};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Without a database the service keeps usage in memory.
    pub database: Option<DatabaseConfig>,
    pub tracker: TrackerOptions,
    pub policy: MeteringPolicy,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database = var("DATABASE_URL").map(|url| DatabaseConfig {
            url,
            max_connections: parse_or(var("DATABASE_MAX_CONNECTIONS"), 10),
            min_connections: parse_or(var("DATABASE_MIN_CONNECTIONS"), 2),
        });

        if database.is_none() && common.is_production() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required in production"
            )));
        }

        let tracker = TrackerOptions {
            batch_size: parse_or(var("USAGE_BATCH_SIZE"), DEFAULT_BATCH_SIZE),
            flush_interval_ms: parse_or(var("USAGE_FLUSH_INTERVAL_MS"), DEFAULT_FLUSH_INTERVAL_MS),
            max_queue_size: parse_or(var("USAGE_MAX_QUEUE_SIZE"), DEFAULT_MAX_QUEUE_SIZE),
            auto_start: parse_flag(var("USAGE_AUTO_START"), true),
        }
        .normalized();

        let enforced_plans = match var("USAGE_ENFORCED_PLANS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(UsagePlan::from_string)
                .collect(),
            None => vec![UsagePlan::Free],
        };

        let policy = MeteringPolicy {
            fail_open: parse_flag(var("USAGE_FAIL_OPEN"), true),
            enforced_plans,
            upgrade_url: var("USAGE_UPGRADE_URL").unwrap_or_else(|| DEFAULT_UPGRADE_URL.to_string()),
        };

        Ok(Self {
            common,
            service_name: var("SERVICE_NAME").unwrap_or_else(|| "metering-service".to_string()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            otlp_endpoint: var("OTLP_ENDPOINT"),
            database,
            tracker,
            policy,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
