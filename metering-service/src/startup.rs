//! Application startup and lifecycle management.

use crate::config::MeteringConfig;
use crate::handlers::health::{health_check, metrics_handler, readiness_check};
use crate::handlers::usage::{get_limit, get_usage};
use crate::handlers::AppState;
use crate::middleware::{identity_middleware, usage_tracking_middleware, UsageMetering};
use crate::services::{init_metrics, InMemoryUsageRepository, PgUsageRepository, UsageRepository};
use crate::tracker::UsageTracker;
use axum::{middleware, routing::get, Router};
use service_core::error::AppError;
use service_core::middleware::{metrics_middleware, request_id_middleware};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Build the HTTP router.
///
/// Tenant routes are metered; probes and `/metrics` are not.
pub fn router(state: AppState) -> Router {
    let metered = Router::new()
        .route("/v1/usage", get(get_usage))
        .route("/v1/usage/limit", get(get_limit))
        .route_layer(middleware::from_fn_with_state(
            state.metering.clone(),
            usage_tracking_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .merge(metered)
        .layer(middleware::from_fn(identity_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    ///
    /// Connects to Postgres and runs migrations when a database is configured,
    /// otherwise keeps usage in memory.
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        init_metrics();

        let repository: Arc<dyn UsageRepository> = match &config.database {
            Some(db) => {
                let repo =
                    PgUsageRepository::connect(&db.url, db.max_connections, db.min_connections)
                        .await
                        .map_err(|e| {
                            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                            e
                        })?;

                repo.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(repo)
            }
            None => {
                tracing::warn!("DATABASE_URL not set; usage is kept in memory and lost on restart");
                Arc::new(InMemoryUsageRepository::new())
            }
        };

        Self::with_repository(config, repository).await
    }

    /// Build around an existing repository.
    pub async fn with_repository(
        config: MeteringConfig,
        repository: Arc<dyn UsageRepository>,
    ) -> Result<Self, AppError> {
        let tracker = UsageTracker::new(repository, config.tracker.clone());
        let metering = UsageMetering::new(tracker, config.policy.clone());
        let state = AppState::new(metering);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            http_port = port,
            batch_size = config.tracker.batch_size,
            flush_interval_ms = config.tracker.flush_interval_ms,
            fail_open = config.policy.fail_open,
            "Metering service listener bound"
        );

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tracker(&self) -> &UsageTracker {
        self.state.tracker()
    }

    /// Serve until `shutdown` resolves, then drain the usage queue.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tracker = self.state.tracker().clone();
        let app = router(self.state);

        tracing::info!(
            service = "metering-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        let served = axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        if let Err(e) = tracker.shutdown().await {
            tracing::error!(
                error = %e,
                queue_size = tracker.diagnostics().queue_size,
                "Failed to drain usage queue on shutdown"
            );
        }

        served.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
