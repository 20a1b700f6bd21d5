//! Durable background jobs
//!
//! Jobs live in the `jobs` table of the main database so that enqueueing
//! can share a transaction with the write that caused it. A
//! [`WorkerPool`] claims due jobs and hands them to a [`JobRunner`].
//!
//! Handlers report failures as [`JobError`]: `Retry` reschedules with
//! exponential backoff until the attempt budget is spent, `Cancel` stops
//! the job immediately.

mod handlers;
mod queue;
mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;

pub use handlers::FederationJobRunner;
pub use queue::JobQueue;
pub use worker::{JobRunner, WorkerHandle, WorkerPool};

/// Typed job arguments, stored as tagged JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobArgs {
    /// Act on a Follow or Undo recorded in a user's inbox
    HandleInbox { user_id: String, activity_id: String },
    /// Deliver one outbox activity to one follower
    HandleOutboxDelivery {
        user_id: String,
        activity_id: String,
        follower_actor_id: String,
    },
}

impl JobArgs {
    pub fn kind(&self) -> &'static str {
        match self {
            JobArgs::HandleInbox { .. } => "handle_inbox",
            JobArgs::HandleOutboxDelivery { .. } => "handle_outbox_delivery",
        }
    }
}

/// How a job attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient; run again later
    #[error("retry: {0}")]
    Retry(String),
    /// Permanent; never run again
    #[error("cancel: {0}")]
    Cancel(String),
}

impl JobError {
    pub fn retry(reason: impl std::fmt::Display) -> Self {
        JobError::Retry(reason.to_string())
    }

    pub fn cancel(reason: impl std::fmt::Display) -> Self {
        JobError::Cancel(reason.to_string())
    }
}

/// Job lifecycle
///
/// `available -> running -> completed`, with `running -> retryable ->
/// running` on transient failure and `cancelled`/`discarded` as the other
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    Available,
    Running,
    Retryable,
    Completed,
    Cancelled,
    Discarded,
}

impl JobState {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Discarded
        )
    }
}

/// A persisted job row
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    /// Tagged JSON of [`JobArgs`]
    pub args: String,
    pub state: JobState,
    /// Attempts started so far
    pub attempt: i64,
    pub max_attempts: i64,
    /// Unix epoch milliseconds
    pub run_at: i64,
    /// Lease expiry for running jobs, unix epoch milliseconds
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn decode_args(&self) -> Result<JobArgs, AppError> {
        serde_json::from_str(&self.args)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("corrupt job args for {}: {e}", self.id)))
    }
}
