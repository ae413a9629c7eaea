//! In-process `JobStore` with the same conditional-update semantics as Postgres.
//!
//! Every method takes the table lock once and evaluates its guard and its write
//! under that lock, which is the in-memory equivalent of a single `UPDATE ... WHERE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::store::{Guard, JobChange, JobStore, StoreError, LEASE_EXPIRED_MESSAGE};
use crate::models::job::{Job, JobStats, JobStatus, JobType};

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StoreError::Unavailable`, as if the database went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a row directly, bypassing every guard. Test setup only.
    pub fn put(&self, job: Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job.id, job);
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Job>>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        self.jobs
            .lock()
            .map_err(|_| StoreError::Unavailable("job table lock poisoned".into()))
    }
}

fn is_candidate(job: &Job, job_types: &[JobType], now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Pending
        && job_types.contains(&job.job_type)
        && job.scheduled_for <= now
        && job.locked_until.map_or(true, |until| until < now)
        && job.attempts < job.max_attempts
}

impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<Uuid, StoreError> {
        let mut jobs = self.table()?;
        jobs.insert(job.id, job.clone());
        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.table()?.get(&id).cloned())
    }

    async fn select_candidate(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let jobs = self.table()?;
        let candidate = jobs
            .values()
            .filter(|job| is_candidate(job, job_types, now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_for.cmp(&b.scheduled_for))
            })
            .cloned();
        Ok(candidate)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.table()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending || job.attempts >= job.max_attempts {
            return Ok(false);
        }

        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.locked_until = Some(lease_until);
        job.attempts += 1;
        job.started_at.get_or_insert(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn update(&self, id: Uuid, guard: Guard, change: &JobChange) -> Result<bool, StoreError> {
        let mut jobs = self.table()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != guard.status || guard.attempts.is_some_and(|n| n != job.attempts) {
            return Ok(false);
        }

        job.status = change.status;
        job.result = change.result.clone();
        job.error_message = change.error_message.clone();
        if let Some(at) = change.scheduled_for {
            job.scheduled_for = at;
        }
        job.completed_at = change.completed_at;
        job.locked_until = None;
        job.updated_at = change.updated_at;
        Ok(true)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.table()?;
        let mut released = 0;
        for job in jobs.values_mut() {
            let expired = job.status == JobStatus::Processing
                && job.locked_until.is_some_and(|until| until < now);
            if !expired {
                continue;
            }

            if job.attempts_exhausted() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            } else {
                job.status = JobStatus::Pending;
                job.completed_at = None;
            }
            job.error_message = Some(LEASE_EXPIRED_MESSAGE.to_string());
            job.locked_until = None;
            job.updated_at = now;
            released += 1;
        }
        Ok(released)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.table()?;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.created_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.table()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status, job.job_type.as_ref(), 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::NewJob;
    use chrono::Duration;

    fn pending(job_type: JobType, priority: i32, scheduled_for: DateTime<Utc>) -> Job {
        NewJob::new(job_type, serde_json::json!({}))
            .priority(priority)
            .scheduled_for(scheduled_for)
            .into_job(Uuid::new_v4(), scheduled_for)
    }

    #[tokio::test]
    async fn test_candidate_skips_ineligible_rows() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let future = pending(JobType::Deployment, 10, now + Duration::minutes(5));
        let mut exhausted = pending(JobType::Deployment, 10, now);
        exhausted.attempts = exhausted.max_attempts;
        let mut processing = pending(JobType::Deployment, 10, now);
        processing.status = JobStatus::Processing;
        processing.locked_until = Some(now + Duration::minutes(10));
        let other_type = pending(JobType::Notification, 10, now);

        for job in [&future, &exhausted, &processing, &other_type] {
            store.put(job.clone());
        }

        let candidate = store
            .select_candidate(&[JobType::Deployment], now)
            .await
            .unwrap();
        assert!(candidate.is_none());

        let eligible = pending(JobType::Deployment, 0, now - Duration::seconds(1));
        store.put(eligible.clone());
        let candidate = store
            .select_candidate(&[JobType::Deployment], now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.id, eligible.id);
    }

    #[tokio::test]
    async fn test_candidate_orders_by_priority_then_schedule() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let low = pending(JobType::Cleanup, 1, now - Duration::minutes(10));
        let high_late = pending(JobType::Cleanup, 5, now - Duration::minutes(1));
        let high_early = pending(JobType::Cleanup, 5, now - Duration::minutes(2));
        for job in [&low, &high_late, &high_early] {
            store.put(job.clone());
        }

        let candidate = store
            .select_candidate(&[JobType::Cleanup], now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(candidate.id, high_early.id);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = pending(JobType::ScreenshotCapture, 0, now);
        store.put(job.clone());
        let id = job.id;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim(id, &format!("w{i}"), now, now + Duration::minutes(10))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_update_respects_guard() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = pending(JobType::Notification, 0, now);
        store.put(job.clone());

        let change = JobChange {
            status: JobStatus::Completed,
            result: Some(serde_json::json!({"ok": true})),
            error_message: None,
            scheduled_for: None,
            completed_at: Some(now),
            updated_at: now,
        };
        let applied = store
            .update(job.id, Guard::status(JobStatus::Processing), &change)
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_claim_rechecks_attempt_budget() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut job = pending(JobType::Deployment, 0, now);
        job.attempts = job.max_attempts;
        store.put(job.clone());

        let claimed = store
            .claim(job.id, "w1", now, now + Duration::minutes(10))
            .await
            .unwrap();
        assert!(!claimed);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, stored.max_attempts);
        assert!(stored.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_update_overwrites_outcome_fields() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut job = pending(JobType::Notification, 0, now);
        job.status = JobStatus::Processing;
        job.attempts = 2;
        job.locked_until = Some(now + Duration::minutes(10));
        job.error_message = Some("timeout".to_string());
        store.put(job.clone());

        let change = JobChange {
            status: JobStatus::Completed,
            result: Some(serde_json::json!({"ok": true})),
            error_message: None,
            scheduled_for: None,
            completed_at: Some(now),
            updated_at: now,
        };
        assert!(store.update(job.id, Guard::claimed(&job), &change).await.unwrap());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.error_message.is_none());
        assert_eq!(stored.scheduled_for, job.scheduled_for);
        assert!(stored.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryJobStore::new();
        store.set_unavailable(true);
        let result = store.select_candidate(&JobType::ALL, Utc::now()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
