//! The broker abstraction the worker pool consumes from.
//!
//! [`QueueClient`] is object safe; the pool holds it as an `Arc<dyn QueueClient>`.
//!
//! Implementations are expected to uphold the following:
//!
//! - [`QueueClient::claim_next`] atomically moves one ready job of the given kind to
//!   [`JobStatus::Active`], increments its `attempts_made`, resets its progress and issues a
//!   fresh [`LeaseToken`]. A job is never handed to two claimers at once.
//! - Every mutation of an active job presents the lease of the claim. A lease the broker no
//!   longer recognises is answered with [`QueueError::LeaseLost`].
//! - [`QueueClient::move_to_dead_letter`] is idempotent: dead-lettering an already dead-lettered
//!   job succeeds without changing it.
//! - [`Release::Interrupted`] refunds the attempt counted by the claim.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobError, JobId, JobStatus, LeaseToken};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError>;

    /// Claims the next ready job of `kind`, if any.
    async fn claim_next(&self, kind: &str) -> Result<Option<Job>, QueueError>;

    /// Marks the job completed with its result.
    async fn ack(
        &self,
        id: &JobId,
        lease: LeaseToken,
        result: serde_json::Value,
    ) -> Result<(), QueueError>;

    /// Gives the job back to the queue to be claimed again after `delay`.
    async fn release(
        &self,
        id: &JobId,
        lease: LeaseToken,
        delay: Duration,
        release: Release,
    ) -> Result<(), QueueError>;

    /// Terminally fails the job, appending `error` to its history.
    async fn move_to_dead_letter(
        &self,
        id: &JobId,
        lease: LeaseToken,
        error: JobError,
    ) -> Result<(), QueueError>;

    async fn update_progress(
        &self,
        id: &JobId,
        lease: LeaseToken,
        progress: u8,
    ) -> Result<(), QueueError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Puts a dead-lettered job back in the queue with a fresh attempt budget.
    async fn requeue(&self, id: &JobId) -> Result<(), QueueError>;

    /// Cancels a job that is not currently running.
    ///
    /// Returns `false` when the job is active or already terminal.
    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError>;
}

/// Why an active job is being handed back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// The attempt failed and should be retried.
    Retry(JobError),
    /// The attempt was cut short by shutdown and does not count.
    Interrupted,
}

/// A job to be inserted into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u16,
    /// How long from now before the job may be claimed.
    pub delay: Duration,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("The lease on {0} is no longer held")]
    LeaseLost(JobId),
    #[error("{id} cannot transition from {status}")]
    InvalidTransition { id: JobId, status: JobStatus },
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
}

impl QueueError {
    /// Connectivity problems that are worth retrying against the broker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
