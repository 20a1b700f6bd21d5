//! Worker pool
//!
//! The pool keeps at most `max_workers` jobs in flight in a `JoinSet`.
//! Each spawned task runs one job through the [`JobRunner`] and writes
//! its outcome back to the queue, so a task panicking or the process
//! dying leaves the job `running` until its lease expires and another
//! claim picks it up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};

use super::{JobArgs, JobError, JobQueue, JobRecord, JobState};
use crate::error::AppError;
use crate::metrics::{JOBS_FINISHED_TOTAL, JOBS_RUNNING};

/// Executes the work behind a job
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, args: JobArgs) -> impl Future<Output = Result<(), JobError>> + Send;
}

/// Claims due jobs and runs them concurrently
pub struct WorkerPool<R> {
    queue: JobQueue,
    runner: Arc<R>,
    max_workers: usize,
    poll_interval: Duration,
}

impl<R> Clone for WorkerPool<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            runner: self.runner.clone(),
            max_workers: self.max_workers,
            poll_interval: self.poll_interval,
        }
    }
}

/// Handle to a started pool
pub struct WorkerHandle {
    processor: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl WorkerHandle {
    /// Stop claiming jobs and wait up to `timeout` for in-flight jobs
    ///
    /// # Errors
    /// `Internal` if the pool did not stop in time or its task panicked
    pub async fn shutdown(self, timeout: Duration) -> Result<(), AppError> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("worker pool did not stop in time")))?
            .map_err(|e| AppError::Internal(anyhow::anyhow!("worker pool task failed: {e}")))
    }
}

impl<R: JobRunner> WorkerPool<R> {
    pub fn new(queue: JobQueue, runner: R) -> Self {
        let config = queue.config();
        let max_workers = config.max_workers.max(1);
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        Self {
            queue,
            runner: Arc::new(runner),
            max_workers,
            poll_interval,
        }
    }

    /// Run due jobs until none are left to claim
    ///
    /// Jobs rescheduled for later are not waited for. Intended for tests
    /// and one-shot maintenance.
    ///
    /// # Returns
    /// The number of attempts executed
    pub async fn drain(&self) -> Result<usize, AppError> {
        let mut executed = 0;
        loop {
            let jobs = self.queue.claim(self.max_workers).await?;
            if jobs.is_empty() {
                return Ok(executed);
            }
            executed += jobs.len();

            let mut in_flight = JoinSet::new();
            for job in jobs {
                in_flight.spawn(run_one(self.queue.clone(), self.runner.clone(), job));
            }
            while let Some(result) = in_flight.join_next().await {
                if let Err(error) = result {
                    tracing::error!(%error, "job task panicked");
                }
            }
        }
    }

    /// Spawn the polling loop
    pub fn start(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let processor = tokio::spawn(self.process(shutdown.clone()));
        WorkerHandle {
            processor,
            shutdown,
        }
    }

    async fn process(self, shutdown: Arc<Notify>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        tracing::info!(max_workers = self.max_workers, "Job worker pool started");

        loop {
            while let Some(result) = in_flight.try_join_next() {
                if let Err(error) = result {
                    tracing::error!(%error, "job task panicked");
                }
            }

            let free = self.max_workers.saturating_sub(in_flight.len());
            let claimed = match self.queue.claim(free).await {
                Ok(jobs) => jobs,
                Err(error) => {
                    tracing::error!(%error, "failed to claim jobs");
                    Vec::new()
                }
            };
            let claimed_any = !claimed.is_empty();
            for job in claimed {
                in_flight.spawn(run_one(self.queue.clone(), self.runner.clone(), job));
            }

            // Claim again straight away while there is work and room for it
            if claimed_any && in_flight.len() < self.max_workers {
                continue;
            }

            if in_flight.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => (),
                    _ = shutdown.notified() => break,
                }
            } else {
                tokio::select! {
                    result = in_flight.join_next() => {
                        if let Some(Err(error)) = result {
                            tracing::error!(%error, "job task panicked");
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => (),
                    _ = shutdown.notified() => break,
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Job worker pool stopping");
        while let Some(result) = in_flight.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "job task panicked");
            }
        }
    }
}

/// Run a claimed job and record its outcome
async fn run_one<R: JobRunner>(queue: JobQueue, runner: Arc<R>, job: JobRecord) {
    let args = match job.decode_args() {
        Ok(args) => args,
        Err(error) => {
            tracing::error!(job_id = %job.id, %error, "cancelling job with unreadable args");
            finish(&job, queue.cancel(&job.id, &error.to_string()).await, "cancelled");
            return;
        }
    };

    tracing::debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "Running job");
    let result = {
        let _running = RunningGuard::new(&JOBS_RUNNING);
        runner.run(args).await
    };

    match result {
        Ok(()) => {
            finish(&job, queue.complete(&job.id).await, "completed");
        }
        Err(JobError::Cancel(reason)) => {
            tracing::warn!(job_id = %job.id, kind = %job.kind, %reason, "Job cancelled");
            finish(&job, queue.cancel(&job.id, &reason).await, "cancelled");
        }
        Err(JobError::Retry(reason)) => match queue.retry(&job, &reason).await {
            Ok(JobState::Discarded) => {
                tracing::warn!(job_id = %job.id, kind = %job.kind, %reason, "Job discarded after final attempt");
                finish(&job, Ok(()), "discarded");
            }
            Ok(_) => {
                tracing::info!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, %reason, "Job will retry");
                finish(&job, Ok(()), "retried");
            }
            Err(error) => finish(&job, Err(error), "retried"),
        },
    }
}

/// Counts a job in `fedipost_jobs_running` until dropped, including when
/// the runner panics
struct RunningGuard<'a>(&'a IntGauge);

impl<'a> RunningGuard<'a> {
    fn new(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn finish(job: &JobRecord, written: Result<(), AppError>, outcome: &str) {
    match written {
        Ok(()) => {
            JOBS_FINISHED_TOTAL
                .with_label_values(&[&job.kind, outcome])
                .inc();
        }
        // The lease runs out and the job is claimed again
        Err(error) => {
            tracing::error!(job_id = %job.id, %error, "failed to record job outcome");
        }
    }
}
