use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Default retry ceiling for newly enqueued jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lifecycle status of a background job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal rows are never mutated again, only deleted by retention cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The closed set of job kinds a worker knows how to route.
///
/// Stored as snake_case text so producers in other services can enqueue by name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    ScreenshotCapture,
    Deployment,
    Cleanup,
    Notification,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::ScreenshotCapture,
        JobType::Deployment,
        JobType::Cleanup,
        JobType::Notification,
    ];
}

/// Optional references back to the CRM records a job was created for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub user_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

/// A row of the shared job table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub worker_id: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub correlation: Correlation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Producer-side request to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub correlation: Correlation,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: 0,
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            correlation: Correlation::default(),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    /// Materialize the row as it is first written: pending, never claimed.
    pub fn into_job(self, id: Uuid, now: DateTime<Utc>) -> Job {
        Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts.max(1),
            worker_id: None,
            locked_until: None,
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            correlation: self.correlation,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Response for querying job status.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result: job.result,
            error_message: job.error_message,
        }
    }
}

/// Aggregate counts over the job table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: i64,
    pub by_status: BTreeMap<JobStatus, i64>,
    pub by_type: BTreeMap<String, i64>,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, job_type: &str, count: i64) {
        self.total += count;
        *self.by_status.entry(status).or_default() += count;
        *self.by_type.entry(job_type.to_string()).or_default() += count;
    }

    pub fn count(&self, status: JobStatus) -> i64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_type_round_trips_through_text() {
        assert_eq!(JobType::ScreenshotCapture.to_string(), "screenshot_capture");
        assert_eq!(JobType::from_str("deployment").unwrap(), JobType::Deployment);
        assert!(JobType::from_str("pdf_render").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_job_defaults() {
        let now = Utc::now();
        let job = NewJob::new(JobType::Notification, serde_json::json!({"to": "ops"}))
            .into_job(Uuid::new_v4(), now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 0);
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.worker_id.is_none());
        assert!(job.locked_until.is_none());
    }

    #[test]
    fn test_stats_serialize_with_status_names() {
        let mut stats = JobStats::default();
        stats.add(JobStatus::Failed, "deployment", 2);
        stats.add(JobStatus::Pending, "cleanup", 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["by_status"]["failed"], 2);
        assert_eq!(json["by_type"]["cleanup"], 1);
    }
}
