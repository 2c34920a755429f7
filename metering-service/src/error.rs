//! Error types for usage metering.

use crate::models::UsageSnapshot;
use service_core::error::AppError;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a [`UsageRepository`](crate::services::UsageRepository).
///
/// The cause is shared so one failed flush can be reported to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
#[error("{context}: {source}")]
pub struct RepositoryError {
    context: String,
    #[source]
    source: Arc<dyn StdError + Send + Sync + 'static>,
}

impl RepositoryError {
    pub fn new<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap a plain message, for stores whose failures are not typed errors.
    pub fn msg(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(context, MessageError(message.into()))
    }

    pub fn context(&self) -> &str {
        &self.context
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

#[derive(Debug, Clone, Error)]
pub enum UsageError {
    #[error("Usage repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Raw records were not stored; the batch went back to the queue.
    #[error("Failed to persist usage batch: {0}")]
    SaveBatch(#[source] RepositoryError),

    /// Raw records are stored but counters were not bumped; not requeued.
    #[error("Failed to increment usage counters: {0}")]
    IncrementUsage(#[source] RepositoryError),

    #[error(
        "Usage limit exceeded for {}: {} of {} calls on plan {}",
        .0.eco_id, .0.api_calls, .0.limit, .0.plan
    )]
    LimitExceeded(Box<UsageSnapshot>),

    #[error("Usage flush task aborted: {0}")]
    FlushAborted(String),
}

impl UsageError {
    /// Whether the records involved are still queued and will be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsageError::SaveBatch(_))
    }

    pub fn snapshot(&self) -> Option<&UsageSnapshot> {
        match self {
            UsageError::LimitExceeded(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Outcome of a metered request that did not produce a response.
#[derive(Debug, Error)]
pub enum MeteringError<E> {
    /// The wrapped handler failed; returned unchanged after its usage was recorded.
    #[error("request handler failed: {0}")]
    Handler(E),

    /// Metering itself failed while the policy is fail-closed.
    #[error(transparent)]
    Usage(UsageError),
}

impl<E> MeteringError<E> {
    pub fn into_handler_error(self) -> Option<E> {
        match self {
            MeteringError::Handler(e) => Some(e),
            MeteringError::Usage(_) => None,
        }
    }
}

impl From<UsageError> for AppError {
    fn from(err: UsageError) -> Self {
        match err {
            UsageError::LimitExceeded(snapshot) => AppError::TooManyRequests(
                format!(
                    "You have exceeded your {} API calls per month limit",
                    snapshot.limit
                ),
                None,
            ),
            UsageError::Repository(e) | UsageError::SaveBatch(e) | UsageError::IncrementUsage(e) => {
                AppError::DatabaseError(anyhow::Error::new(e))
            }
            UsageError::FlushAborted(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
        }
    }
}
