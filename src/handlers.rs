//! Registers the handler for each job type this deployment can run.

use std::sync::Arc;

use serde::Deserialize;

use crate::config::WorkerConfig;
use crate::db::store::JobStore;
use crate::models::job::{Job, JobType};
use crate::registry::{HandlerError, HandlerRegistry, HandlerResult};
use crate::services::collaborators::CollaboratorClient;
use crate::services::queue::{JobQueue, QueueError};

#[derive(Debug, Default, Deserialize)]
struct CleanupPayload {
    retention_days: Option<u32>,
}

/// Build the registry for a worker process.
///
/// Collaborator-backed types are only registered when their service URL is
/// configured; `cleanup` always runs in-process against the queue.
pub fn build_registry<S: JobStore>(
    config: &WorkerConfig,
    queue: Arc<JobQueue<S>>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let token = config.collaborator_api_token.clone();

    let collaborators = [
        (JobType::ScreenshotCapture, &config.screenshot_service_url),
        (JobType::Deployment, &config.deploy_service_url),
        (JobType::Notification, &config.notification_webhook_url),
    ];
    for (job_type, url) in collaborators {
        match url {
            Some(url) => {
                let client = CollaboratorClient::new(url.clone(), token.clone());
                register_collaborator(&mut registry, job_type, client);
            }
            None => tracing::debug!(%job_type, "No collaborator URL configured, handler not registered"),
        }
    }

    let default_retention_days = config.retention_days;
    registry.register(JobType::Cleanup, move |job: Job| {
        let queue = queue.clone();
        async move { run_cleanup(&queue, &job, default_retention_days).await }
    });

    registry
}

pub fn register_collaborator(
    registry: &mut HandlerRegistry,
    job_type: JobType,
    client: CollaboratorClient,
) {
    tracing::info!(%job_type, endpoint = client.endpoint(), "Registering collaborator handler");
    let client = Arc::new(client);
    registry.register(job_type, move |job: Job| {
        let client = client.clone();
        async move { client.dispatch(&job).await.map_err(HandlerError::from) }
    });
}

async fn run_cleanup<S: JobStore>(
    queue: &JobQueue<S>,
    job: &Job,
    default_retention_days: u32,
) -> HandlerResult {
    let payload: CleanupPayload = if job.payload.is_null() {
        CleanupPayload::default()
    } else {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::permanent(format!("invalid cleanup payload: {e}")))?
    };
    let retention_days = payload.retention_days.unwrap_or(default_retention_days);

    let deleted = queue.cleanup(retention_days).await.map_err(|e| match e {
        QueueError::InvalidRetention(_) => HandlerError::permanent(e),
        _ => HandlerError::retryable(e),
    })?;

    Ok(serde_json::json!({
        "deleted": deleted,
        "retention_days": retention_days,
    }))
}
