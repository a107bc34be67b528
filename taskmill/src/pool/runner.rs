use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use tokio::{task::JoinError, time::Instant};
use tracing::{instrument, Instrument};

use crate::{
    backoff::Strategy,
    dead_letter::{DeadLetterError, DeadLetterReason},
    events::JobEvent,
    handler::{registry::ErasedHandler, ClassifiedError, Completion, Progress},
    job::{ErrorType, Job, JobError, LeaseToken},
    queue::{QueueError, Release},
};

use super::Shared;

/// The smallest delay a retry is scheduled with.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// How an attempt left the slot.
enum Attempt {
    Finished(Result<Completion, ClassifiedError>),
    /// The drain timeout elapsed while the handler was still running.
    Interrupted,
}

/// Runs one claimed job to a resolution the queue has accepted.
pub(crate) struct JobRunner {
    shared: Arc<Shared>,
}

impl JobRunner {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Runs `job`, treating a panic outside the handler's own task as a failed attempt.
    ///
    /// Handler hooks such as [`JobHandler::timeout`](crate::handler::JobHandler::timeout) and
    /// [`JobHandler::backoff`](crate::handler::JobHandler::backoff) run on the slot itself.
    pub(crate) async fn run_supervised(&self, job: Job) {
        let started = Instant::now();
        let Err(panic) = AssertUnwindSafe(self.execute_job(job.clone()))
            .catch_unwind()
            .await
        else {
            return;
        };
        let job_id = &job.id;
        let message = panic_message(panic.as_ref());
        tracing::error!(%job_id, "Job {job_id} panicked outside its handler: {message}");
        if let Some(lease) = job.lease {
            let error = ClassifiedError::transient(ErrorType::Panic, message);
            self.resolve_failure(&job, lease, None, error, started.elapsed())
                .await;
        }
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, kind = %job.kind, attempt = job.attempts_made)
    )]
    async fn execute_job(&self, job: Job) {
        let job_id = &job.id;
        let Some(lease) = job.lease else {
            tracing::error!(%job_id, "Claimed job {job_id} has no lease, skipping");
            return;
        };
        tracing::debug!(%job_id, "Claimed job {job_id}");
        self.shared.events.emit(JobEvent::Claimed {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            attempt: job.attempts_made,
        });

        if job.attempts_made > job.max_attempts {
            let error = JobError {
                attempt: job.max_attempts,
                error_type: ErrorType::Exhausted,
                details: format!(
                    "Claimed on attempt {} of {}",
                    job.attempts_made, job.max_attempts
                ),
                recorded_at: Utc::now(),
            };
            self.dead_letter(&job, lease, DeadLetterReason::Exhausted, error, Duration::ZERO)
                .await;
            return;
        }

        let started = Instant::now();
        let handler = self.shared.registry.get(&job.kind);
        let result = match &handler {
            Some(handler) => {
                let progress = Progress::new(
                    job.id.clone(),
                    job.kind.clone(),
                    job.attempts_made,
                    lease,
                    self.shared.queue.clone(),
                    self.shared.events.clone(),
                );
                match handler.dispatch(job.payload.clone(), progress) {
                    Ok(dispatch) => {
                        let timeout = dispatch.timeout.or(self.shared.config.job_timeout());
                        tracing::debug!(%job_id, ?timeout, "Executing job {job_id}");
                        match self.run(dispatch.future, timeout).await {
                            Attempt::Finished(result) => result,
                            Attempt::Interrupted => {
                                self.hand_back(&job, lease, true).await;
                                return;
                            }
                        }
                    }
                    Err(error) => Err(error),
                }
            }
            None => Err(ClassifiedError::permanent(
                "unknown_kind",
                format!("No handler registered for {}", job.kind),
            )),
        };
        let duration = started.elapsed();

        match result {
            Ok(completion) => self.complete(&job, lease, completion, duration).await,
            Err(error) => {
                self.resolve_failure(&job, lease, handler.as_deref(), error, duration)
                    .await
            }
        }
    }

    /// Hands back a job claimed after the pool began stopping.
    pub(crate) async fn release_unstarted(&self, job: Job) {
        if let Some(lease) = job.lease {
            self.hand_back(&job, lease, false).await;
        }
    }

    async fn run(
        &self,
        future: impl Future<Output = Result<Completion, ClassifiedError>> + Send + 'static,
        timeout: Option<Duration>,
    ) -> Attempt {
        let mut task = tokio::spawn(
            async move {
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, future)
                        .await
                        .unwrap_or_else(|_| Err(timed_out(timeout))),
                    None => future.await,
                }
            }
            .in_current_span(),
        );

        tokio::select! {
            result = &mut task => Attempt::Finished(result.unwrap_or_else(|error| Err(error.into()))),
            _ = self.shared.drain.cancelled() => {
                task.abort();
                Attempt::Interrupted
            }
        }
    }

    /// Decides between retrying and dead-lettering a failed attempt.
    ///
    /// This is the only place the attempt ceiling is compared.
    async fn resolve_failure(
        &self,
        job: &Job,
        lease: LeaseToken,
        handler: Option<&dyn ErasedHandler>,
        error: ClassifiedError,
        duration: Duration,
    ) {
        let job_error = JobError {
            attempt: job.attempts_made,
            error_type: error.error_type,
            details: error.message,
            recorded_at: Utc::now(),
        };
        if !error.retryable {
            self.dead_letter(job, lease, DeadLetterReason::Permanent, job_error, duration)
                .await;
        } else if job.attempts_made >= job.max_attempts {
            self.dead_letter(job, lease, DeadLetterReason::Exhausted, job_error, duration)
                .await;
        } else {
            let delay = handler
                .and_then(|handler| handler.backoff(job.attempts_made))
                .unwrap_or_else(|| self.shared.retry_backoff.backoff(job.attempts_made))
                .max(MIN_RETRY_DELAY);
            self.retry(job, lease, job_error, delay, duration).await;
        }
    }

    async fn complete(
        &self,
        job: &Job,
        lease: LeaseToken,
        completion: Completion,
        duration: Duration,
    ) {
        let job_id = &job.id;
        let Completion { result, usage } = completion;
        let acked = self
            .with_broker_retries(job, "acknowledge", || {
                self.shared.queue.ack(job_id, lease, result.clone())
            })
            .await;
        if acked.is_ok() {
            tracing::info!(%job_id, ?duration, "Job {job_id} complete");
            self.shared.stats.record_completed();
            self.shared.events.emit(JobEvent::Completed {
                job_id: job.id.clone(),
                kind: job.kind.clone(),
                attempt: job.attempts_made,
                duration,
                usage,
            });
        }
    }

    async fn retry(
        &self,
        job: &Job,
        lease: LeaseToken,
        error: JobError,
        delay: Duration,
        duration: Duration,
    ) {
        let job_id = &job.id;
        tracing::warn!(
            %job_id,
            ?error,
            "Job {job_id} failed and will be retried in {delay:?}: error type: {}, message: {}",
            error.error_type,
            error.details
        );
        let released = self
            .with_broker_retries(job, "release", || {
                self.shared
                    .queue
                    .release(job_id, lease, delay, Release::Retry(error.clone()))
            })
            .await;
        if released.is_ok() {
            self.shared.stats.record_retried();
            self.shared.events.emit(JobEvent::RetryScheduled {
                job_id: job.id.clone(),
                kind: job.kind.clone(),
                attempt: job.attempts_made,
                duration,
                delay,
                error,
            });
        }
    }

    async fn dead_letter(
        &self,
        job: &Job,
        lease: LeaseToken,
        reason: DeadLetterReason,
        error: JobError,
        duration: Duration,
    ) {
        let job_id = &job.id;
        tracing::error!(
            %job_id,
            ?error,
            %reason,
            "Job {job_id} failed and will be dead-lettered: error type: {}, message: {}",
            error.error_type,
            error.details
        );
        let buried = self
            .with_broker_retries(job, "dead-letter", || {
                self.shared.dead_letters.bury(job, reason, error.clone())
            })
            .await;
        let attempt = match buried {
            Ok(entry) => entry.attempts_made,
            Err(err) if err.is_lease_lost() => return,
            Err(_) => {
                // The queue record stands in for the entry until the store is back.
                let moved = self
                    .with_broker_retries(job, "dead-letter", || {
                        self.shared
                            .queue
                            .move_to_dead_letter(job_id, lease, error.clone())
                    })
                    .await;
                if moved.is_err() {
                    return;
                }
                tracing::error!(
                    %job_id,
                    "Job {job_id} dead-lettered without a dead-letter entry, replay will rebuild it from the queue"
                );
                job.attempts_made.min(job.max_attempts)
            }
        };
        self.shared.stats.record_dead_lettered();
        self.shared.events.emit(JobEvent::DeadLettered {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            attempt,
            duration,
            reason,
            error,
        });
    }

    /// Releases a job the pool is giving up on while stopping. `started` tells a job interrupted
    /// by the drain timeout from one claimed after claiming stopped.
    async fn hand_back(&self, job: &Job, lease: LeaseToken, started: bool) {
        let job_id = &job.id;
        if started {
            tracing::warn!(%job_id, "Job {job_id} did not finish before the drain timeout, releasing");
        } else {
            tracing::debug!(%job_id, "Job {job_id} claimed while stopping, releasing");
        }
        let released = self
            .with_broker_retries(job, "release", || {
                self.shared
                    .queue
                    .release(job_id, lease, Duration::ZERO, Release::Interrupted)
            })
            .await;
        if released.is_ok() {
            self.shared.stats.record_released(started);
            self.shared.events.emit(JobEvent::Released {
                job_id: job.id.clone(),
                kind: job.kind.clone(),
                attempt: job.attempts_made,
            });
        }
    }

    /// Runs `call` until the queue accepts it, the error is not transient, or the configured
    /// number of attempts is used up.
    async fn with_broker_retries<T, E, F, Fut>(
        &self,
        job: &Job,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, E>
    where
        E: BrokerError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let job_id = &job.id;
        let attempts = self.shared.config.broker_retry_attempts;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_lease_lost() => {
                    tracing::warn!(
                        %job_id,
                        "Lost the lease on {job_id} before it could {operation}, dropping the outcome"
                    );
                    return Err(err);
                }
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.shared.broker_backoff.backoff(attempt - 1);
                    tracing::warn!(
                        ?err,
                        %job_id,
                        "Failed to {operation} {job_id}, retrying in {delay:?}, error: {err:?}",
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to {operation} {job_id}, error: {err:?}",
                    );
                    return Err(err);
                }
            }
        }
    }
}

/// Failures from the queue or dead-letter store as seen by the runner.
trait BrokerError: std::fmt::Debug {
    fn is_transient(&self) -> bool;

    fn is_lease_lost(&self) -> bool;
}

impl BrokerError for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }

    fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost(_))
    }
}

impl BrokerError for DeadLetterError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Queue(error) => error.is_transient(),
            Self::Store(_) => true,
            _ => false,
        }
    }

    fn is_lease_lost(&self) -> bool {
        matches!(self, Self::Queue(QueueError::LeaseLost(_)))
    }
}

fn timed_out(timeout: Duration) -> ClassifiedError {
    ClassifiedError::transient(
        ErrorType::Timeout,
        format!("Job failed to complete within timeout: {timeout:?}"),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Job panicked".to_owned())
}

impl From<JoinError> for ClassifiedError {
    fn from(value: JoinError) -> Self {
        let message = match value.try_into_panic() {
            Ok(panic) => panic_message(panic.as_ref()),
            Err(err) => err.to_string(),
        };
        Self::transient(ErrorType::Panic, message)
    }
}
