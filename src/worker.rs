//! The long-running claim → execute → finalize loop.
//!
//! One job at a time per worker. Delivery is at-least-once and handlers must be
//! idempotent: a job whose worker dies mid-run is reclaimed after its lease runs
//! out and executed again.
//!
//! Handlers must also yield to cancellation. The handler future is dropped a
//! little before the stored `locked_until` and the attempt recorded as a
//! retryable failure. That keeps a live worker's run inside its lease only
//! while the handler keeps awaiting; a handler that blocks its thread cannot be
//! cut off, and another worker may reclaim and run the job alongside it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::db::store::JobStore;
use crate::models::job::{Job, JobType};
use crate::registry::{HandlerError, HandlerRegistry};
use crate::services::queue::{FailOutcome, FailureKind, JobQueue, QueueError};

/// Upper bound on the slack left between the handler deadline and lease expiry.
const MAX_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

/// Runtime knobs of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub job_types: Vec<JobType>,
    pub poll_interval: Duration,
    /// Claim length. Handler calls are cut off shortly before it ends.
    pub lease_duration: Duration,
    pub max_consecutive_errors: u32,
    pub error_backoff_cap: Duration,
}

impl WorkerOptions {
    /// `min(poll_interval * 2^errors, error_backoff_cap)`.
    pub fn error_backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_errors);
        self.poll_interval
            .saturating_mul(factor)
            .min(self.error_backoff_cap)
    }
}

/// Outcome of one loop iteration that did not hit a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing eligible to claim.
    Idle,
    /// A job was claimed, executed and finalized.
    Processed,
}

pub struct Worker<S> {
    queue: Arc<JobQueue<S>>,
    registry: Arc<HandlerRegistry>,
    options: WorkerOptions,
    shutdown: watch::Receiver<bool>,
}

impl<S: JobStore> Worker<S> {
    pub fn new(
        queue: Arc<JobQueue<S>>,
        registry: Arc<HandlerRegistry>,
        options: WorkerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            registry,
            options,
            shutdown,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown is requested, or until `max_consecutive_errors` store
    /// errors in a row.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.options.worker_id,
            job_types = ?self.options.job_types,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            lease_secs = self.options.lease_duration.as_secs(),
            "Worker started"
        );

        let mut consecutive_errors: u32 = 0;
        loop {
            if self.shutdown_requested() {
                info!(worker_id = %self.options.worker_id, "Shutdown requested, worker stopping");
                return Ok(());
            }

            match self.tick().await {
                Ok(Tick::Processed) => {
                    consecutive_errors = 0;
                    trace!("Job processed, checking for next job");
                }
                Ok(Tick::Idle) => {
                    consecutive_errors = 0;
                    trace!("No jobs available, sleeping");
                    self.idle(self.options.poll_interval).await;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    metrics::counter!("worker_loop_errors_total").increment(1);
                    error!(
                        worker_id = %self.options.worker_id,
                        error = %err,
                        consecutive_errors,
                        max_consecutive_errors = self.options.max_consecutive_errors,
                        "Worker loop error"
                    );

                    if consecutive_errors >= self.options.max_consecutive_errors {
                        return Err(WorkerError::TooManyConsecutiveErrors {
                            count: consecutive_errors,
                            last: err,
                        });
                    }

                    let backoff = self.options.error_backoff(consecutive_errors);
                    debug!(backoff_ms = backoff.as_millis() as u64, "Backing off after loop error");
                    self.idle(backoff).await;
                }
            }
        }
    }

    /// Sleep, waking early if shutdown is requested.
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            Ok(()) = self.shutdown.changed() => {}
        }
    }

    /// Reap expired leases, claim one job, run it and record the outcome.
    ///
    /// Errors are store errors only; handler failures are recorded on the job.
    pub async fn tick(&self) -> Result<Tick, QueueError> {
        let reaped = self.queue.release_expired_leases().await?;
        if reaped > 0 {
            metrics::counter!("jobs_reaped_total").increment(reaped);
        }

        let Some(job) = self
            .queue
            .claim_next(
                &self.options.job_types,
                &self.options.worker_id,
                self.options.lease_duration,
            )
            .await?
        else {
            return Ok(Tick::Idle);
        };

        let span = tracing::info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            job.attempt = job.attempts
        );
        self.process(job).instrument(span).await?;
        Ok(Tick::Processed)
    }

    async fn process(&self, job: Job) -> Result<(), QueueError> {
        let job_type = job.job_type.to_string();
        metrics::counter!("jobs_claimed_total", "job_type" => job_type.clone()).increment(1);

        let started = Instant::now();
        let outcome = self.execute(&job).await;
        metrics::histogram!("job_duration_seconds", "job_type" => job_type.clone())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                if self.queue.complete(&job, result).await? {
                    metrics::counter!("jobs_completed_total", "job_type" => job_type).increment(1);
                }
            }
            Err(err) => {
                warn!(error = %err, permanent = err.is_permanent(), "Job handler failed");
                let kind = if err.is_permanent() {
                    FailureKind::Permanent
                } else {
                    FailureKind::Retryable
                };
                match self.queue.fail_with(&job, &err.to_string(), kind).await? {
                    FailOutcome::Retrying { .. } => {
                        metrics::counter!("jobs_retried_total", "job_type" => job_type).increment(1);
                    }
                    FailOutcome::Failed => {
                        metrics::counter!("jobs_failed_total", "job_type" => job_type).increment(1);
                    }
                    FailOutcome::Stale => {}
                }
            }
        }
        Ok(())
    }

    /// Look up and run the handler. Never fails the loop: a missing handler,
    /// a handler error, a panic and an overrun all come back as `HandlerError`.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        let handler = self.registry.get(job.job_type)?;
        debug!("Running job handler");

        let run = AssertUnwindSafe(handler(job.clone())).catch_unwind();
        match tokio::time::timeout(self.handler_deadline(job), run).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(HandlerError::retryable(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(HandlerError::retryable(format!(
                "handler exceeded lease of {:?}",
                self.options.lease_duration
            ))),
        }
    }
}

impl<S> Worker<S> {
    /// Time left on the claim's lease, minus a margin of a tenth of the lease
    /// (at most `MAX_DEADLINE_MARGIN`). The lease was stamped before the claim
    /// round-trip, so this is shorter than `lease_duration`.
    fn handler_deadline(&self, job: &Job) -> Duration {
        let margin = (self.options.lease_duration / 10).min(MAX_DEADLINE_MARGIN);
        let remaining = match job.locked_until {
            Some(until) => (until - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.options.lease_duration,
        };
        remaining.saturating_sub(margin)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker stopped after {count} consecutive loop errors, last: {last}")]
    TooManyConsecutiveErrors { count: u32, last: QueueError },
}
