use std::str::FromStr;
use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::models::job::JobType;
use crate::services::queue::RetryPolicy;
use crate::worker::WorkerOptions;

#[derive(Debug, Deserialize, Validate)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// How often to poll the job table when idle
    #[serde(default = "default_poll_interval_seconds")]
    #[garde(range(min = 1, max = 3600))]
    pub poll_interval_seconds: u64,

    /// Lease owner identity written to `worker_id`
    #[serde(default = "default_worker_identity")]
    #[garde(length(min = 1, max = 200))]
    pub worker_identity: String,

    /// Consecutive claim/finalize errors before the process exits
    #[serde(default = "default_max_consecutive_errors")]
    #[garde(range(min = 1))]
    pub max_consecutive_errors: u32,

    /// Job types this process claims (comma-separated)
    #[serde(
        default = "default_supported_job_types",
        deserialize_with = "job_types_from_list"
    )]
    #[garde(length(min = 1))]
    pub supported_job_types: Vec<JobType>,

    /// How long a claim is held before it becomes reclaimable
    #[serde(default = "default_lease_duration_seconds")]
    #[garde(range(min = 1))]
    pub lease_duration_seconds: u64,

    /// Upper bound on the retry backoff of a failed job
    #[serde(default = "default_max_retry_delay_minutes")]
    #[garde(range(min = 1, max = 10080))]
    pub max_retry_delay_minutes: i64,

    /// Upper bound on the worker's own backoff after store errors
    #[serde(default = "default_error_backoff_cap_seconds")]
    #[garde(range(min = 1))]
    pub error_backoff_cap_seconds: u64,

    /// Default retention window for `cleanup` jobs
    #[serde(default = "default_retention_days")]
    #[garde(range(min = 1, max = 36500))]
    pub retention_days: u32,

    /// Prometheus exporter bind address (e.g., "0.0.0.0:9100"); disabled when unset
    #[garde(skip)]
    pub metrics_addr: Option<String>,

    /// Apply pending migrations before starting the loop
    #[serde(default)]
    #[garde(skip)]
    pub run_migrations: bool,

    /// Screenshot capture service endpoint
    #[garde(skip)]
    pub screenshot_service_url: Option<String>,

    /// Site deployment service endpoint
    #[garde(skip)]
    pub deploy_service_url: Option<String>,

    /// Notification delivery webhook
    #[garde(skip)]
    pub notification_webhook_url: Option<String>,

    /// Bearer token sent to collaborator services
    #[garde(skip)]
    pub collaborator_api_token: Option<String>,
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_worker_identity() -> String {
    format!("worker-{}", Uuid::new_v4())
}

fn default_max_consecutive_errors() -> u32 {
    10
}

fn default_supported_job_types() -> Vec<JobType> {
    JobType::ALL.to_vec()
}

fn job_types_from_list<'de, D>(deserializer: D) -> Result<Vec<JobType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            JobType::from_str(s)
                .map_err(|_| serde::de::Error::custom(format!("unknown job type '{s}'")))
        })
        .collect()
}

fn default_lease_duration_seconds() -> u64 {
    600
}

fn default_max_retry_delay_minutes() -> i64 {
    60
}

fn default_error_backoff_cap_seconds() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            worker_id: self.worker_identity.clone(),
            job_types: self.supported_job_types.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            max_consecutive_errors: self.max_consecutive_errors,
            error_backoff_cap: Duration::from_secs(self.error_backoff_cap_seconds),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_delay_minutes(self.max_retry_delay_minutes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
