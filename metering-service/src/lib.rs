//! metering-service: per-tenant API usage metering and plan quota enforcement.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod tracker;
