use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::store::{Guard, JobChange, JobStore, StoreError, LEASE_EXPIRED_MESSAGE};
use crate::models::job::{Correlation, Job, JobStats, JobStatus, JobType};

const JOB_COLUMNS: &str = r#"
    id, job_type, payload, priority, scheduled_for, status, attempts, max_attempts,
    worker_id, locked_until, started_at, completed_at, result, error_message,
    user_id, lead_id, project_id, created_at, updated_at
"#;

/// `JobStore` over the `background_jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: JobType::from_str(&job_type)
            .map_err(|_| StoreError::Decode(format!("unknown job_type '{job_type}'")))?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        scheduled_for: row.try_get("scheduled_for")?,
        status: JobStatus::from_str(&status)
            .map_err(|_| StoreError::Decode(format!("unknown status '{status}'")))?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        worker_id: row.try_get("worker_id")?,
        locked_until: row.try_get("locked_until")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        correlation: Correlation {
            user_id: row.try_get("user_id")?,
            lead_id: row.try_get("lead_id")?,
            project_id: row.try_get("project_id")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO background_jobs
                (id, job_type, payload, priority, scheduled_for, status, attempts, max_attempts,
                 user_id, lead_id, project_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(job.job_type.as_ref())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.scheduled_for)
        .bind(job.status.as_ref())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.correlation.user_id)
        .bind(job.correlation.lead_id)
        .bind(job.correlation.project_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn select_candidate(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let types: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM background_jobs
            WHERE status = 'pending'
              AND job_type = ANY($1)
              AND scheduled_for <= $2
              AND (locked_until IS NULL OR locked_until < $2)
              AND attempts < max_attempts
            ORDER BY priority DESC, scheduled_for ASC
            LIMIT 1
            "#
        ))
        .bind(&types)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = 'processing',
                worker_id = $2,
                locked_until = $3,
                attempts = attempts + 1,
                started_at = COALESCE(started_at, $4),
                updated_at = $4
            WHERE id = $1
              AND status = 'pending'
              AND attempts < max_attempts
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, id: Uuid, guard: Guard, change: &JobChange) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = $2,
                result = $3,
                error_message = $4,
                scheduled_for = COALESCE($5, scheduled_for),
                completed_at = $6,
                locked_until = NULL,
                updated_at = $7
            WHERE id = $1
              AND status = $8
              AND ($9::INTEGER IS NULL OR attempts = $9)
            "#,
        )
        .bind(id)
        .bind(change.status.as_ref())
        .bind(&change.result)
        .bind(&change.error_message)
        .bind(change.scheduled_for)
        .bind(change.completed_at)
        .bind(change.updated_at)
        .bind(guard.status.as_ref())
        .bind(guard.attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempts >= max_attempts THEN $1 ELSE NULL END,
                error_message = $2,
                locked_until = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND locked_until < $1
            "#,
        )
        .bind(now)
        .bind(LEASE_EXPIRED_MESSAGE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM background_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, job_type, COUNT(*) AS count
            FROM background_jobs
            GROUP BY status, job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let job_type: String = row.try_get("job_type")?;
            let count: i64 = row.try_get("count")?;
            let status = JobStatus::from_str(&status)
                .map_err(|_| StoreError::Decode(format!("unknown status '{status}'")))?;
            stats.add(status, &job_type, count);
        }

        Ok(stats)
    }
}
