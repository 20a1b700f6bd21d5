//! Job queue persistence

use std::time::Duration;

use chrono::Utc;
use sqlx::SqliteConnection;

use super::{JobArgs, JobRecord, JobState};
use crate::config::JobsConfig;
use crate::data::{Database, EntityId, store::timestamp_now};
use crate::error::AppError;
use crate::metrics::JOBS_ENQUEUED_TOTAL;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable job queue backed by the `jobs` table
#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Database,
    config: JobsConfig,
}

impl JobQueue {
    pub fn new(db: Database, config: JobsConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Insert a job on the caller's connection
    ///
    /// Pass an open transaction to make the enqueue atomic with the write
    /// that produced it.
    ///
    /// # Returns
    /// The new job's ID
    pub async fn enqueue(
        &self,
        conn: &mut SqliteConnection,
        args: &JobArgs,
    ) -> Result<String, AppError> {
        let id = EntityId::new().0;
        let now = timestamp_now();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, args, state, attempt, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(args.kind())
        .bind(serde_json::to_string(args)?)
        .bind(JobState::Available)
        .bind(self.config.max_attempts)
        .bind(now_millis())
        .bind(&now)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        JOBS_ENQUEUED_TOTAL.with_label_values(&[args.kind()]).inc();
        tracing::debug!(job_id = %id, kind = args.kind(), "Enqueued job");
        Ok(id)
    }

    /// Claim up to `limit` due jobs and mark them running
    ///
    /// Due means `available`/`retryable` with `run_at` in the past, or
    /// `running` with an expired lease (the worker holding it died).
    /// Each claim starts a new attempt. An expired lease on a job that has
    /// no attempts left discards it instead.
    pub async fn claim(&self, limit: usize) -> Result<Vec<JobRecord>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = now_millis();
        self.discard_abandoned(now).await?;
        let lease_ms = i64::try_from(self.config.lease_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET
                state = 'running',
                attempt = attempt + 1,
                locked_until = ?,
                updated_at = ?
            WHERE id IN (
                SELECT id FROM jobs
                WHERE (state IN ('available', 'retryable') AND run_at <= ?)
                   OR (state = 'running' AND locked_until < ?)
                ORDER BY run_at ASC, id ASC
                LIMIT ?
            )
            RETURNING *
            "#,
        )
        .bind(now.saturating_add(lease_ms))
        .bind(timestamp_now())
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(jobs)
    }

    async fn discard_abandoned(&self, now: i64) -> Result<(), AppError> {
        let timestamp = timestamp_now();
        let discarded = sqlx::query(
            r#"
            UPDATE jobs SET
                state = 'discarded',
                locked_until = NULL,
                last_error = 'lease expired on final attempt',
                updated_at = ?,
                finalized_at = ?
            WHERE state = 'running' AND locked_until < ? AND attempt >= max_attempts
            "#,
        )
        .bind(&timestamp)
        .bind(&timestamp)
        .bind(now)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if discarded > 0 {
            tracing::warn!(discarded, "Discarded jobs whose final attempt never finished");
        }
        Ok(())
    }

    pub async fn complete(&self, id: &str) -> Result<(), AppError> {
        self.finalize(id, JobState::Completed, None).await
    }

    pub async fn cancel(&self, id: &str, reason: &str) -> Result<(), AppError> {
        self.finalize(id, JobState::Cancelled, Some(reason)).await
    }

    /// Reschedule a failed attempt, or discard the job once it has used all
    /// of its attempts
    ///
    /// # Returns
    /// The state the job was moved to
    pub async fn retry(&self, job: &JobRecord, reason: &str) -> Result<JobState, AppError> {
        if job.attempt >= job.max_attempts {
            self.finalize(&job.id, JobState::Discarded, Some(reason)).await?;
            return Ok(JobState::Discarded);
        }

        let delay = self.backoff(job.attempt);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, run_at = ?, locked_until = NULL, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobState::Retryable)
        .bind(now_millis().saturating_add(delay_ms))
        .bind(reason)
        .bind(timestamp_now())
        .bind(&job.id)
        .execute(self.db.pool())
        .await?;

        Ok(JobState::Retryable)
    }

    /// Delay before the next attempt after `attempt` failures
    ///
    /// `base * 2^(attempt - 1)`, capped at the configured maximum.
    pub fn backoff(&self, attempt: i64) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1).max(0)).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let seconds = self
            .config
            .backoff_base_seconds
            .saturating_mul(factor)
            .min(self.config.backoff_max_seconds);
        Duration::from_secs(seconds)
    }

    async fn finalize(
        &self,
        id: &str,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<(), AppError> {
        let now = timestamp_now();
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?,
                locked_until = NULL,
                last_error = COALESCE(?, last_error),
                updated_at = ?,
                finalized_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state)
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<JobRecord, AppError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(AppError::NotFound)
    }

    /// All jobs, optionally filtered by state, oldest first
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRecord>, AppError> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, JobRecord>(
                    "SELECT * FROM jobs WHERE state = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(state)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")
                    .fetch_all(self.db.pool())
                    .await?
            }
        };
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use tempfile::TempDir;

    async fn create_queue() -> (JobQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"), 2)
            .await
            .unwrap();
        let mut config = valid_config().jobs;
        config.max_attempts = 2;
        (JobQueue::new(db, config), temp_dir)
    }

    fn inbox_args() -> JobArgs {
        JobArgs::HandleInbox {
            user_id: "u1".to_string(),
            activity_id: "https://remote.example/follows/1".to_string(),
        }
    }

    async fn enqueue(queue: &JobQueue, args: &JobArgs) -> String {
        let mut conn = queue.db.pool().acquire().await.unwrap();
        queue.enqueue(&mut conn, args).await.unwrap()
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let (mut queue, _temp_dir) = create_queue().await;
        queue.config.backoff_base_seconds = 15;
        queue.config.backoff_max_seconds = 100;

        assert_eq!(queue.backoff(1), Duration::from_secs(15));
        assert_eq!(queue.backoff(2), Duration::from_secs(30));
        assert_eq!(queue.backoff(3), Duration::from_secs(60));
        assert_eq!(queue.backoff(4), Duration::from_secs(100));
        assert_eq!(queue.backoff(200), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn claim_marks_running_and_counts_attempts() {
        let (queue, _temp_dir) = create_queue().await;
        let id = enqueue(&queue, &inbox_args()).await;

        let claimed = queue.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].state, JobState::Running);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].decode_args().unwrap(), inbox_args());

        // Leased jobs are not handed out twice
        assert!(queue.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_and_cancel_are_final() {
        let (queue, _temp_dir) = create_queue().await;
        let first = enqueue(&queue, &inbox_args()).await;
        let second = enqueue(&queue, &inbox_args()).await;
        queue.claim(10).await.unwrap();

        queue.complete(&first).await.unwrap();
        queue.cancel(&second, "actor has no inbox").await.unwrap();

        let first = queue.get(&first).await.unwrap();
        assert_eq!(first.state, JobState::Completed);
        assert!(first.finalized_at.is_some());

        let second = queue.get(&second).await.unwrap();
        assert_eq!(second.state, JobState::Cancelled);
        assert_eq!(second.last_error.as_deref(), Some("actor has no inbox"));
        assert!(queue.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_reschedules_then_discards() {
        let (queue, _temp_dir) = create_queue().await;
        let id = enqueue(&queue, &inbox_args()).await;

        let job = queue.claim(1).await.unwrap().remove(0);
        assert_eq!(queue.retry(&job, "503").await.unwrap(), JobState::Retryable);

        let stored = queue.get(&id).await.unwrap();
        assert_eq!(stored.state, JobState::Retryable);
        assert!(stored.run_at > Utc::now().timestamp_millis());
        assert_eq!(stored.last_error.as_deref(), Some("503"));
        // Not due yet
        assert!(queue.claim(1).await.unwrap().is_empty());

        // Force it due and use up the last attempt
        sqlx::query("UPDATE jobs SET run_at = 0 WHERE id = ?")
            .bind(&id)
            .execute(queue.db.pool())
            .await
            .unwrap();
        let job = queue.claim(1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 2);
        assert_eq!(queue.retry(&job, "503 again").await.unwrap(), JobState::Discarded);
        assert_eq!(queue.get(&id).await.unwrap().state, JobState::Discarded);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let (queue, _temp_dir) = create_queue().await;
        let id = enqueue(&queue, &inbox_args()).await;
        queue.claim(1).await.unwrap();

        sqlx::query("UPDATE jobs SET locked_until = 0 WHERE id = ?")
            .bind(&id)
            .execute(queue.db.pool())
            .await
            .unwrap();

        let reclaimed = queue.claim(1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn expired_lease_on_final_attempt_is_discarded() {
        let (queue, _temp_dir) = create_queue().await;
        let id = enqueue(&queue, &inbox_args()).await;

        // max_attempts is 2: both attempts start and neither finishes
        for expected_attempt in 1..=2 {
            let claimed = queue.claim(1).await.unwrap();
            assert_eq!(claimed[0].attempt, expected_attempt);
            sqlx::query("UPDATE jobs SET locked_until = 0 WHERE id = ?")
                .bind(&id)
                .execute(queue.db.pool())
                .await
                .unwrap();
        }

        assert!(queue.claim(1).await.unwrap().is_empty());
        let job = queue.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert_eq!(job.attempt, 2);
        assert!(job.finalized_at.is_some());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_state() {
        let (queue, _temp_dir) = create_queue().await;
        let first = enqueue(&queue, &inbox_args()).await;
        enqueue(&queue, &inbox_args()).await;
        queue.claim(1).await.unwrap();
        queue.complete(&first).await.unwrap();

        assert_eq!(queue.list_jobs(None).await.unwrap().len(), 2);
        assert_eq!(queue.list_jobs(Some(JobState::Completed)).await.unwrap().len(), 1);
        assert_eq!(queue.list_jobs(Some(JobState::Available)).await.unwrap().len(), 1);
    }
}
