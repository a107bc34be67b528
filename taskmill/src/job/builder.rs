use std::{marker::PhantomData, time::Duration};

use serde::Serialize;

use crate::{
    handler::JobHandler,
    queue::{EnqueuableJob, QueueClient},
    TaskmillError,
};

use super::JobId;

/// Attempt ceiling used when neither the builder nor the pool configuration sets one.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// Builds and enqueues a job for the handler `H`.
///
/// ```
/// # use taskmill::prelude::*;
/// # use taskmill::queue::memory::InMemoryQueue;
/// # use std::time::Duration;
/// # struct Ping;
/// # #[async_trait::async_trait]
/// # impl JobHandler for Ping {
/// #     type Payload = String;
/// #     const KIND: &'static str = "ping";
/// #     async fn execute(&self, _: String, _: Progress) -> Result<Completion, ClassifiedError> {
/// #         Ok(Completion::default())
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let queue = InMemoryQueue::new();
/// let id = JobBuilder::<Ping>::new()
///     .with_payload("hello".to_owned())
///     .with_max_attempts(5)
///     .schedule_in(Duration::from_secs(30))
///     .enqueue(&queue)
///     .await
///     .unwrap();
/// # assert_eq!(queue.get_job(&id).await.unwrap().unwrap().max_attempts, 5);
/// # });
/// ```
pub struct JobBuilder<H>
where
    H: JobHandler,
    H::Payload: Serialize,
{
    payload: Option<H::Payload>,
    max_attempts: u16,
    delay: Duration,
    _handler: PhantomData<fn() -> H>,
}

impl<H> Default for JobBuilder<H>
where
    H: JobHandler,
    H::Payload: Serialize,
{
    fn default() -> Self {
        Self {
            payload: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::ZERO,
            _handler: PhantomData,
        }
    }
}

impl<H> JobBuilder<H>
where
    H: JobHandler,
    H::Payload: Serialize,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(self, payload: H::Payload) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn schedule_in(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Enqueues the job. A missing payload is sent as `null`.
    pub async fn enqueue<Q>(self, queue: &Q) -> Result<JobId, TaskmillError>
    where
        Q: QueueClient + ?Sized,
    {
        if self.max_attempts == 0 {
            return Err(TaskmillError::InvalidJob("max_attempts must be at least 1"));
        }
        let job_id = queue
            .enqueue(EnqueuableJob {
                kind: H::KIND.to_owned(),
                payload: serde_json::to_value(self.payload)?,
                max_attempts: self.max_attempts,
                delay: self.delay,
            })
            .await?;
        tracing::debug!(job_id = %job_id, kind = H::KIND, "Enqueued {job_id}");
        Ok(job_id)
    }
}
