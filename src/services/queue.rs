use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::store::{Guard, JobChange, JobStore, StoreError};
use crate::models::job::{Job, JobStats, JobStatus, JobStatusView, JobType, NewJob};

/// How many times `claim_next` re-selects after losing a claim race.
const CLAIM_RACE_RETRIES: usize = 3;

/// Largest accepted retry delay cap (one week).
pub const MAX_RETRY_DELAY_MINUTES: i64 = 7 * 24 * 60;

/// Backoff applied between attempts of a failed job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Upper bound on the `2^attempts` minute delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delay: Duration::minutes(60),
        }
    }
}

impl RetryPolicy {
    /// Cap clamped to `1..=MAX_RETRY_DELAY_MINUTES`.
    pub fn with_max_delay_minutes(minutes: i64) -> Self {
        Self {
            max_delay: Duration::minutes(minutes.clamp(1, MAX_RETRY_DELAY_MINUTES)),
        }
    }

    /// `min(2^attempts minutes, max_delay)`.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, 62) as u32;
        let minutes = 1i64.checked_shl(exponent).unwrap_or(i64::MAX);
        let cap = self.max_delay.num_minutes().max(1);
        Duration::minutes(minutes.min(cap))
    }
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

/// What `fail` did to the row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailOutcome {
    /// Back to `pending`, eligible again at `retry_at`.
    Retrying { retry_at: DateTime<Utc> },
    /// Terminal `failed`.
    Failed,
    /// The row was no longer held by this claim; nothing changed.
    Stale,
}

/// Decide the post-failure state of a claimed job.
pub fn failure_change(
    job: &Job,
    message: &str,
    kind: FailureKind,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> JobChange {
    if kind == FailureKind::Permanent || job.attempts_exhausted() {
        JobChange {
            status: JobStatus::Failed,
            result: None,
            error_message: Some(message.to_string()),
            scheduled_for: None,
            completed_at: Some(now),
            updated_at: now,
        }
    } else {
        JobChange {
            status: JobStatus::Pending,
            result: None,
            error_message: Some(message.to_string()),
            scheduled_for: Some(now + policy.delay_for(job.attempts)),
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Producer and lifecycle API over a `JobStore`.
pub struct JobQueue<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a pending job. No check is made that any worker handles `job_type`,
    /// and identical requests create distinct jobs.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Uuid, QueueError> {
        let job = new_job.into_job(Uuid::new_v4(), Utc::now());
        let id = self.store.insert(&job).await?;

        info!(
            job_id = %id,
            job_type = %job.job_type,
            priority = job.priority,
            scheduled_for = %job.scheduled_for,
            "Job enqueued"
        );
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Option<JobStatusView>, QueueError> {
        Ok(self.store.get(id).await?.map(JobStatusView::from))
    }

    /// Claim the best eligible job of `job_types` for `worker_id`, holding it for `lease`.
    ///
    /// Returns the job as it stands after the claim.
    pub async fn claim_next(
        &self,
        job_types: &[JobType],
        worker_id: &str,
        lease: StdDuration,
    ) -> Result<Option<Job>, QueueError> {
        let lease = Duration::from_std(lease).map_err(|_| QueueError::InvalidLease(lease))?;

        for _ in 0..CLAIM_RACE_RETRIES {
            let now = Utc::now();
            let Some(mut job) = self.store.select_candidate(job_types, now).await? else {
                return Ok(None);
            };

            let lease_until = now + lease;
            if !self.store.claim(job.id, worker_id, now, lease_until).await? {
                debug!(job_id = %job.id, worker_id, "Lost claim race, selecting again");
                continue;
            }

            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.to_string());
            job.locked_until = Some(lease_until);
            job.attempts += 1;
            job.started_at.get_or_insert(now);
            job.updated_at = now;

            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                worker_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "Job claimed"
            );
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Record success for a job this worker claimed.
    ///
    /// Returns `false` when the claim is no longer current (lease reaped or job
    /// reclaimed), in which case the result is dropped.
    pub async fn complete(&self, job: &Job, result: serde_json::Value) -> Result<bool, QueueError> {
        let now = Utc::now();
        let change = JobChange {
            status: JobStatus::Completed,
            result: Some(result),
            error_message: None,
            scheduled_for: None,
            completed_at: Some(now),
            updated_at: now,
        };

        let applied = self.store.update(job.id, Guard::claimed(job), &change).await?;
        if applied {
            info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "Job completed");
        } else {
            warn!(job_id = %job.id, attempt = job.attempts, "Claim no longer current, result dropped");
        }
        Ok(applied)
    }

    /// Record a retryable failure.
    pub async fn fail(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        self.fail_with(job, message, FailureKind::Retryable).await
    }

    /// Record a failure that must not be retried.
    pub async fn fail_permanently(&self, job: &Job, message: &str) -> Result<FailOutcome, QueueError> {
        self.fail_with(job, message, FailureKind::Permanent).await
    }

    pub async fn fail_with(
        &self,
        job: &Job,
        message: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome, QueueError> {
        let change = failure_change(job, message, kind, &self.retry, Utc::now());

        if !self.store.update(job.id, Guard::claimed(job), &change).await? {
            warn!(job_id = %job.id, attempt = job.attempts, "Claim no longer current, failure not recorded");
            return Ok(FailOutcome::Stale);
        }

        match (change.status, change.scheduled_for) {
            (JobStatus::Pending, Some(retry_at)) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    %retry_at,
                    error = message,
                    "Job failed, retry scheduled"
                );
                Ok(FailOutcome::Retrying { retry_at })
            }
            _ => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    error = message,
                    "Job failed permanently"
                );
                Ok(FailOutcome::Failed)
            }
        }
    }

    /// `pending -> cancelled`. Returns whether the job actually transitioned.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let now = Utc::now();
        let change = JobChange {
            status: JobStatus::Cancelled,
            result: None,
            error_message: None,
            scheduled_for: None,
            completed_at: None,
            updated_at: now,
        };

        let cancelled = self
            .store
            .update(id, Guard::status(JobStatus::Pending), &change)
            .await?;
        if cancelled {
            info!(job_id = %id, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Return rows whose lease ran out to the pool (or to `failed` when exhausted).
    pub async fn release_expired_leases(&self) -> Result<u64, QueueError> {
        let released = self.store.release_expired(Utc::now()).await?;
        if released > 0 {
            warn!(released, "Released jobs with expired leases");
        }
        Ok(released)
    }

    /// Delete terminal jobs created more than `retention_days` ago.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64, QueueError> {
        let cutoff = Duration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or(QueueError::InvalidRetention(retention_days))?;
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        info!(deleted, retention_days, %cutoff, "Old jobs cleaned up");
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lease duration out of range: {0:?}")]
    InvalidLease(StdDuration),

    #[error("Retention of {0} days reaches outside the representable date range")]
    InvalidRetention(u32),
}
