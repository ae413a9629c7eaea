use reqwest::{Client, StatusCode};
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::{Job, JobType};
use crate::registry::HandlerError;

/// HTTP client for an external service that performs one kind of job
/// (screenshot capture, site deployment, notification delivery).
///
/// The job id is sent as `Idempotency-Key`, since a job can be delivered more
/// than once when a lease runs out.
#[derive(Clone)]
pub struct CollaboratorClient {
    http: Client,
    endpoint: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct DispatchRequest<'a> {
    job_id: Uuid,
    job_type: JobType,
    attempt: i32,
    payload: &'a serde_json::Value,
}

impl CollaboratorClient {
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hand a job to the collaborator and return its JSON response as the job result.
    pub async fn dispatch(&self, job: &Job) -> Result<serde_json::Value, CollaboratorError> {
        let body = DispatchRequest {
            job_id: job.id,
            job_type: job.job_type,
            attempt: job.attempts,
            payload: &job.payload,
        };

        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Idempotency-Key", job.id.to_string())
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        tracing::debug!(job_id = %job.id, endpoint = %self.endpoint, "Dispatching job to collaborator");
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collaborator responded {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Collaborator returned invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CollaboratorError {
    /// Client errors other than timeouts and rate limits will not succeed on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                status.is_client_error()
                    && *status != StatusCode::REQUEST_TIMEOUT
                    && *status != StatusCode::TOO_MANY_REQUESTS
            }
            Self::Http(_) | Self::Parse(_) => false,
        }
    }
}

impl From<CollaboratorError> for HandlerError {
    fn from(err: CollaboratorError) -> Self {
        if err.is_permanent() {
            HandlerError::permanent(err)
        } else {
            HandlerError::retryable(err)
        }
    }
}
