//! Postgres-backed usage repository.

use super::metrics::DB_QUERY_DURATION;
use super::repository::{TenantCounts, UsageRepository};
use crate::error::RepositoryError;
use crate::models::{resolve_plan_limit, UsagePlan, UsageRecord, UsageSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{info, instrument};

/// Postgres binds at most 65535 parameters per statement; 9 per record.
const INSERT_CHUNK_SIZE: usize = 5_000;

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    plan: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct UsageCountersRow {
    api_calls: i64,
    overage_calls: i64,
}

/// Usage repository over a Postgres connection pool.
#[derive(Clone)]
pub struct PgUsageRepository {
    pool: PgPool,
}

impl PgUsageRepository {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "metering-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    #[instrument(skip(self, records), fields(batch_size = records.len()))]
    async fn save_batch(&self, records: &[UsageRecord]) -> Result<(), RepositoryError> {
        if records.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_batch"])
            .start_timer();
        let fail = |e: sqlx::Error| RepositoryError::new("Failed to persist usage batch", e);

        // One transaction so a retried batch is never half-stored.
        let mut tx = self.pool.begin().await.map_err(fail)?;

        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO eco_api_usage (eco_id, endpoint, method, timestamp, response_time_ms, status_code, api_key_id, user_agent, ip_address) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(&record.eco_id)
                    .push_bind(&record.endpoint)
                    .push_bind(&record.method)
                    .push_bind(record.timestamp)
                    .push_bind(record.response_time_ms)
                    .push_bind(i32::from(record.status_code))
                    .push_bind(&record.api_key_id)
                    .push_bind(&record.user_agent)
                    .push_bind(&record.ip_address);
            });
            builder.build().execute(&mut *tx).await.map_err(fail)?;
        }

        tx.commit().await.map_err(fail)?;
        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, counts), fields(tenants = counts.len()))]
    async fn increment_usage(&self, counts: &TenantCounts) -> Result<(), RepositoryError> {
        if counts.is_empty() {
            return Ok(());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_usage"])
            .start_timer();
        let fail = |e: sqlx::Error| RepositoryError::new("Failed to increment usage counters", e);

        let mut tx = self.pool.begin().await.map_err(fail)?;
        for (eco_id, count) in counts {
            sqlx::query("SELECT increment_api_calls($1::text, $2::bigint)")
                .bind(eco_id)
                .bind(*count)
                .execute(&mut *tx)
                .await
                .map_err(fail)?;
        }
        tx.commit().await.map_err(fail)?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_current_usage(
        &self,
        eco_id: &str,
    ) -> Result<Option<UsageSnapshot>, RepositoryError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_current_usage"])
            .start_timer();
        let fail =
            |e: sqlx::Error| RepositoryError::new("Failed to fetch current usage snapshot", e);

        let subscription = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT plan, current_period_start, current_period_end
            FROM eco_subscriptions
            WHERE eco_id = $1
            ORDER BY current_period_start DESC
            LIMIT 1
            "#,
        )
        .bind(eco_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(fail)?;

        let Some(subscription) = subscription else {
            timer.observe_duration();
            return Ok(None);
        };

        let counters = sqlx::query_as::<_, UsageCountersRow>(
            r#"
            SELECT api_calls, overage_calls
            FROM eco_usage_records
            WHERE eco_id = $1 AND billing_period_start = $2
            LIMIT 1
            "#,
        )
        .bind(eco_id)
        .bind(subscription.current_period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(fail)?;

        timer.observe_duration();

        let (api_calls, overage_calls) = counters
            .map(|c| (c.api_calls, c.overage_calls))
            .unwrap_or((0, 0));

        Ok(Some(UsageSnapshot {
            eco_id: eco_id.to_string(),
            limit: resolve_plan_limit(&subscription.plan),
            plan: UsagePlan::from(subscription.plan),
            api_calls,
            overage_calls,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
        }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), RepositoryError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::new("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }
}
