pub mod collaborators;
pub mod queue;

pub use collaborators::{CollaboratorClient, CollaboratorError};
pub use queue::{FailOutcome, FailureKind, JobQueue, QueueError, RetryPolicy};
