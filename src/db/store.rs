use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, JobStats, JobStatus, JobType};

/// Message recorded on jobs whose lease ran out while still `processing`.
pub const LEASE_EXPIRED_MESSAGE: &str = "lease expired";

/// Precondition for a conditional update.
///
/// The row must still be in `status`, and when `attempts` is set, still belong
/// to the claim that produced that attempt number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guard {
    pub status: JobStatus,
    pub attempts: Option<i32>,
}

impl Guard {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            attempts: None,
        }
    }

    /// Guard held by the worker that produced `job` through a claim.
    pub fn claimed(job: &Job) -> Self {
        Self {
            status: JobStatus::Processing,
            attempts: Some(job.attempts),
        }
    }
}

/// Field changes applied by a finalizer. Always clears the lease.
///
/// `result`, `error_message` and `completed_at` describe the new outcome and are
/// written as given, so a success after a failed attempt carries no stale error.
/// `None` for `scheduled_for` keeps the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct JobChange {
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence contract over the shared job table.
///
/// The table is the only coordination primitive between worker processes, so
/// every ownership-changing method is a single conditional update whose
/// affected-row count decides the outcome.
pub trait JobStore: Send + Sync + 'static {
    /// Insert a fully materialized pending row.
    fn insert(&self, job: &Job) -> impl Future<Output = Result<Uuid, StoreError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    /// Highest-priority eligible row of one of `job_types`, earliest schedule first.
    fn select_candidate(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    /// `pending -> processing`, assigning owner and lease. Returns whether this call won.
    fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Apply `change` only if `guard` still holds. Returns whether a row changed.
    fn update(
        &self,
        id: Uuid,
        guard: Guard,
        change: &JobChange,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Return `processing` rows whose lease ended before `now` to the pool, or to
    /// `failed` when no attempts remain.
    fn release_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Hard-delete terminal rows created before `cutoff`.
    fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<JobStats, StoreError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed job row: {0}")]
    Decode(String),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}
