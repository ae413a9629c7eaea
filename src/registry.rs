use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::models::job::{Job, JobType};

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Type-erased async job handler.
pub type Handler = Arc<dyn Fn(Job) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Maps each job type to the function that performs its work.
///
/// Built once at worker startup and handed to the worker loop; there is no
/// process-wide registry.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous registration.
    pub fn register<F, Fut>(&mut self, job_type: JobType, handler: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |job| handler(job).boxed());
        if self.handlers.insert(job_type, handler).is_some() {
            tracing::warn!(%job_type, "Replacing previously registered handler");
        }
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Handler, RegistryError> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or(RegistryError::Unregistered(job_type))
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Fail fast when a worker is configured to claim a type nothing can run.
    pub fn ensure_registered(&self, job_types: &[JobType]) -> Result<(), RegistryError> {
        match job_types.iter().find(|t| !self.contains(**t)) {
            Some(missing) => Err(RegistryError::Unregistered(*missing)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("No handler registered for job type '{0}'")]
    Unregistered(JobType),
}

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt after backoff.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help; the job goes straight to `failed`.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl fmt::Display) -> Self {
        Self::Retryable(message.to_string())
    }

    pub fn permanent(message: impl fmt::Display) -> Self {
        Self::Permanent(message.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<RegistryError> for HandlerError {
    fn from(err: RegistryError) -> Self {
        Self::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::NewJob;
    use chrono::Utc;
    use uuid::Uuid;

    fn job(job_type: JobType) -> Job {
        NewJob::new(job_type, serde_json::json!({"n": 2})).into_job(Uuid::new_v4(), Utc::now())
    }

    #[tokio::test]
    async fn test_registered_handler_is_invoked() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::Notification, |job: Job| async move {
            Ok(serde_json::json!({"echo": job.payload["n"]}))
        });

        let handler = registry.get(JobType::Notification).unwrap();
        let result = handler(job(JobType::Notification)).await.unwrap();
        assert_eq!(result["echo"], 2);
    }

    #[test]
    fn test_missing_handler_is_typed_error() {
        let registry = HandlerRegistry::new();
        let err = registry.get(JobType::Deployment).err().unwrap();
        assert_eq!(err, RegistryError::Unregistered(JobType::Deployment));
        assert_eq!(
            err.to_string(),
            "No handler registered for job type 'deployment'"
        );
        assert!(HandlerError::from(err).is_permanent());
    }

    #[test]
    fn test_ensure_registered_reports_first_gap() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::Cleanup, |_job: Job| async { Ok(serde_json::Value::Null) });

        assert!(registry.ensure_registered(&[JobType::Cleanup]).is_ok());
        assert_eq!(
            registry.ensure_registered(&[JobType::Cleanup, JobType::Notification]),
            Err(RegistryError::Unregistered(JobType::Notification))
        );
        assert_eq!(registry.job_types(), vec![JobType::Cleanup]);
    }
}
