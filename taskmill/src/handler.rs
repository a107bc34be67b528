//! The pluggable unit of business logic run for each job kind.
use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    events::{EventBus, JobEvent},
    job::{ErrorType, JobId, LeaseToken},
    queue::QueueClient,
};

pub(crate) mod registry;

/// Runs jobs of one kind.
///
/// # Example
///
/// ```
/// # use taskmill::prelude::*;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Summarise {
///     text: String,
/// }
///
/// struct SummariseHandler;
///
/// #[async_trait::async_trait]
/// impl JobHandler for SummariseHandler {
///     type Payload = Summarise;
///     const KIND: &'static str = "summarise";
///
///     async fn execute(
///         &self,
///         payload: Self::Payload,
///         progress: Progress,
///     ) -> Result<Completion, ClassifiedError> {
///         if payload.text.is_empty() {
///             return Err(ClassifiedError::permanent("validation", "nothing to summarise"));
///         }
///         progress.report(50).await;
///         let summary: String = payload.text.chars().take(10).collect();
///         Ok(Completion::new(serde_json::json!({ "summary": summary })))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The decoded job payload. A payload that fails to decode dead-letters the job.
    type Payload: DeserializeOwned + Send + 'static;

    /// The job kind this handler is registered for.
    ///
    /// This is a static string rather than the type name so the handler type can be renamed
    /// without orphaning jobs already in the queue.
    const KIND: &'static str;

    async fn execute(
        &self,
        payload: Self::Payload,
        progress: Progress,
    ) -> Result<Completion, ClassifiedError>;

    /// Per job timeout, taking precedence over the pool's `job_timeout_ms`.
    fn timeout(&self, _payload: &Self::Payload) -> Option<Duration> {
        None
    }

    /// Overrides the pool's retry delay for this kind.
    fn backoff(&self, _attempts_made: u16) -> Option<Duration> {
        None
    }
}

/// The successful outcome of an attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub result: serde_json::Value,
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            usage: None,
        }
    }

    pub fn with_usage(self, usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..self
        }
    }
}

impl From<serde_json::Value> for Completion {
    fn from(result: serde_json::Value) -> Self {
        Self::new(result)
    }
}

/// Resource consumption reported by a handler, forwarded to the metrics recorder.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens: u64,
    pub cost: f64,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.tokens += rhs.tokens;
        self.cost += rhs.cost;
    }
}

/// An error type a handler can propagate with `?`.
///
/// Errors are retryable unless [`ExecutionError::is_retryable`] says otherwise.
pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;

    fn is_retryable(&self) -> bool {
        true
    }
}

/// A handler failure together with its retry classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub error_type: ErrorType,
    pub message: String,
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn transient(error_type: impl Into<ErrorType>, message: impl Display) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn permanent(error_type: impl Into<ErrorType>, message: impl Display) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.to_string(),
            retryable: false,
        }
    }

    pub(crate) fn decode(error: serde_json::Error) -> Self {
        Self::permanent(ErrorType::Decode, format!("Failed to decode payload: {error}"))
    }
}

impl Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl Error for ClassifiedError {}

impl<T> From<T> for ClassifiedError
where
    T: ExecutionError,
{
    fn from(value: T) -> Self {
        Self {
            error_type: ErrorType::from(value.error_type()),
            message: value.to_string(),
            retryable: value.is_retryable(),
        }
    }
}

/// Reports progress of the running attempt.
///
/// Progress is monotonic within an attempt: values below the last reported value are ignored
/// and values above 100 are clamped.
#[derive(Clone)]
pub struct Progress {
    job_id: JobId,
    kind: String,
    attempt: u16,
    lease: LeaseToken,
    queue: Arc<dyn QueueClient>,
    events: EventBus,
    last: Arc<AtomicU8>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("job_id", &self.job_id)
            .field("attempt", &self.attempt)
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}

impl Progress {
    pub(crate) fn new(
        job_id: JobId,
        kind: String,
        attempt: u16,
        lease: LeaseToken,
        queue: Arc<dyn QueueClient>,
        events: EventBus,
    ) -> Self {
        Self {
            job_id,
            kind,
            attempt,
            lease,
            queue,
            events,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The attempt being run, starting at 1.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    /// The last value accepted.
    pub fn current(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }

    pub async fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent <= previous {
            return;
        }
        let job_id = &self.job_id;
        let _ = self
            .queue
            .update_progress(job_id, self.lease, percent)
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    ?err,
                    %job_id,
                    "Failed to record progress {percent} for {job_id}, error: {err:?}",
                )
            });
        self.events.emit(JobEvent::Progress {
            job_id: self.job_id.clone(),
            kind: self.kind.clone(),
            attempt: self.attempt,
            percent,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::{memory::InMemoryQueue, EnqueuableJob};

    #[derive(Debug, thiserror::Error)]
    #[error("provider overloaded")]
    struct Overloaded;

    impl ExecutionError for Overloaded {
        fn error_type(&self) -> &'static str {
            "provider"
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("prompt rejected")]
    struct Rejected;

    impl ExecutionError for Rejected {
        fn error_type(&self) -> &'static str {
            "validation"
        }

        fn is_retryable(&self) -> bool {
            false
        }
    }

    fn fail_with<E: ExecutionError>(error: E) -> Result<(), ClassifiedError> {
        Err(error)?
    }

    #[test]
    fn execution_errors_convert_with_their_classification() {
        let error = fail_with(Overloaded).unwrap_err();
        assert_eq!(error.error_type, ErrorType::Other("provider".to_owned()));
        assert_eq!(error.message, "provider overloaded");
        assert!(error.retryable);

        let error = fail_with(Rejected).unwrap_err();
        assert!(!error.retryable);
    }

    #[test]
    fn builtin_error_types_are_recognised() {
        let error = ClassifiedError::transient("timeout", "slow");
        assert_eq!(error.error_type, ErrorType::Timeout);
        assert_eq!(error.to_string(), "timeout: slow");
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let job = queue.claim_next("generate").await.unwrap().unwrap();
        let bus = EventBus::new(None);
        let mut events = bus.subscribe();
        let progress = Progress::new(
            id.clone(),
            job.kind,
            1,
            job.lease.unwrap(),
            Arc::new(queue.clone()),
            bus,
        );

        progress.report(30).await;
        progress.report(10).await;
        progress.report(250).await;

        assert_eq!(progress.current(), 100);
        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().progress, 100);
        let percents: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| match event {
                JobEvent::Progress { percent, .. } => percent,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(percents, [30, 100]);
    }

    #[tokio::test]
    async fn progress_survives_a_lost_lease() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let progress = Progress::new(
            id,
            "generate".to_owned(),
            1,
            LeaseToken::from(99),
            Arc::new(queue),
            EventBus::new(None),
        );

        progress.report(50).await;
        assert_eq!(progress.current(), 50);
    }
}
