use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_stream::StreamExt;

use super::*;
use crate::{
    dead_letter::{DeadLetterError, InMemoryDeadLetterStore, MockDeadLetterStore},
    handler::{ClassifiedError, Completion, Progress, Usage},
    job::{ErrorType, JobError, JobId, JobStatus, LeaseToken},
    metrics::{InMemoryRecorder, Outcome},
    prelude::DeadLetterReason,
    queue::{memory::InMemoryQueue, EnqueuableJob, MockQueueClient, Release},
};

/// Observes what the handler was asked to do.
#[derive(Clone, Default)]
struct Observer {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    started: Arc<Mutex<Vec<(JobId, u16, Instant)>>>,
}

impl Observer {
    fn enter(&self, progress: &Progress) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.started.lock().unwrap().push((
            progress.job_id().clone(),
            progress.attempt(),
            Instant::now(),
        ));
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn starts_of(&self, id: &JobId) -> Vec<Instant> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, ..)| job_id == id)
            .map(|(.., at)| *at)
            .collect()
    }

    fn all_starts(&self) -> Vec<Instant> {
        let mut starts: Vec<_> = self.started.lock().unwrap().iter().map(|(.., at)| *at).collect();
        starts.sort();
        starts
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Task {
    sleep_ms: u64,
    /// Attempts up to and including this one fail.
    fail_attempts: u16,
    permanent: bool,
    panic: bool,
    /// Held up between the claim and its result by [`SlowClaims`].
    slow_claim: bool,
}

impl Task {
    fn sleeping(sleep_ms: u64) -> Self {
        Self {
            sleep_ms,
            ..Self::default()
        }
    }

    fn failing(fail_attempts: u16) -> Self {
        Self {
            fail_attempts,
            ..Self::default()
        }
    }
}

struct TaskHandler {
    observer: Observer,
}

#[async_trait]
impl JobHandler for TaskHandler {
    type Payload = Task;
    const KIND: &'static str = "task";

    async fn execute(
        &self,
        task: Self::Payload,
        progress: Progress,
    ) -> Result<Completion, ClassifiedError> {
        self.observer.enter(&progress);
        tokio::time::sleep(Duration::from_millis(task.sleep_ms)).await;
        self.observer.exit();
        progress.report(100).await;

        if task.panic {
            panic!("handler exploded");
        }
        if progress.attempt() <= task.fail_attempts {
            return Err(if task.permanent {
                ClassifiedError::permanent("validation", "prompt rejected")
            } else {
                ClassifiedError::transient("provider", "provider overloaded")
            });
        }
        Ok(
            Completion::new(serde_json::json!({ "attempt": progress.attempt() })).with_usage(
                Usage {
                    tokens: 10,
                    cost: 0.01,
                },
            ),
        )
    }
}

fn config() -> PoolConfig {
    PoolConfig::default().with_jitter_seed(7)
}

fn pool(queue: &InMemoryQueue, config: PoolConfig, observer: &Observer) -> WorkerPool {
    WorkerPool::new(queue.clone(), InMemoryDeadLetterStore::new(), config).with_handler(
        TaskHandler {
            observer: observer.clone(),
        },
    )
}

async fn enqueue(handle: &PoolHandle, task: Task) -> JobId {
    handle
        .job::<TaskHandler>()
        .with_payload(task)
        .enqueue(handle.queue())
        .await
        .unwrap()
}

async fn wait_until(handle: &PoolHandle, condition: impl Fn(PoolStats) -> bool) {
    tokio::time::timeout(Duration::from_secs(3_600), async {
        while !condition(handle.stats()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("pool never reached expected state: {:?}", handle.stats()));
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_concurrency() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(
        &queue,
        config()
            .with_concurrency(5)
            .with_rate_limit(1_000, Duration::from_secs(1)),
        &observer,
    )
    .start()
    .unwrap();

    for _ in 0..100 {
        enqueue(&handle, Task::sleeping(10)).await;
    }
    wait_until(&handle, |stats| stats.completed == 100).await;

    assert!(observer.peak.load(Ordering::SeqCst) <= 5);
    assert!(handle.stats().peak_active <= 5);
    assert_eq!(observer.calls.load(Ordering::SeqCst), 100);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn never_exceeds_rate_limit() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let window = Duration::from_millis(1_000);
    let handle = pool(
        &queue,
        config().with_concurrency(50).with_rate_limit(20, window),
        &observer,
    )
    .start()
    .unwrap();

    for _ in 0..100 {
        enqueue(&handle, Task::default()).await;
    }
    wait_until(&handle, |stats| stats.completed == 100).await;

    let starts = observer.all_starts();
    assert_eq!(starts.len(), 100);
    for (earliest, latest) in starts.iter().zip(starts.iter().skip(20)) {
        assert!(
            *latest - *earliest >= window,
            "21 dispatches within {:?}",
            *latest - *earliest
        );
    }
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_job_is_dead_lettered_after_max_attempts() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(&queue, config().with_max_attempts("task", 3), &observer)
        .start()
        .unwrap();

    let id = enqueue(&handle, Task::failing(u16::MAX)).await;
    wait_until(&handle, |stats| stats.dead_lettered == 1).await;

    let starts = observer.starts_of(&id);
    assert_eq!(starts.len(), 3);
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(first_gap >= Duration::from_millis(1_600));
    assert!(second_gap > first_gap);

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.errors.len(), 3);

    let entry = handle.dead_letters().get(&id).await.unwrap().unwrap();
    assert_eq!(entry.attempts_made, 3);
    assert_eq!(entry.reason, DeadLetterReason::Exhausted);
    assert_eq!(entry.history.len(), 3);
    assert_eq!(handle.stats().retried, 2);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_dead_lettered_immediately() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(&queue, config(), &observer).start().unwrap();

    let id = enqueue(
        &handle,
        Task {
            fail_attempts: 1,
            permanent: true,
            ..Task::default()
        },
    )
    .await;
    wait_until(&handle, |stats| stats.dead_lettered == 1).await;

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempts_made, 1);
    let entry = handle.dead_letters().get(&id).await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Permanent);
    assert_eq!(entry.error.error_type, ErrorType::from("validation"));
    assert_eq!(entry.payload["permanent"], true);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn success_after_retry_records_failure_then_success() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let recorder = InMemoryRecorder::new();
    let handle = pool(&queue, config(), &observer)
        .with_recorder(recorder.clone())
        .start()
        .unwrap();
    let mut events = handle.subscribe();

    let id = enqueue(&handle, Task::failing(1)).await;
    wait_until(&handle, |stats| stats.completed == 1).await;
    handle.stop().await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.result, Some(serde_json::json!({ "attempt": 2 })));

    let samples = recorder.samples().unwrap();
    let outcomes: Vec<_> = samples
        .iter()
        .map(|sample| (sample.outcome, sample.attempts_made))
        .collect();
    assert_eq!(outcomes, [(Outcome::Failed, 1), (Outcome::Success, 2)]);
    assert_eq!(samples[1].usage.map(|usage| usage.tokens), Some(10));

    let lifecycle: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| !matches!(event, JobEvent::Progress { .. }))
        .map(|event| match event {
            JobEvent::Claimed { attempt, .. } => ("claimed", attempt),
            JobEvent::RetryScheduled { attempt, .. } => ("retry-scheduled", attempt),
            JobEvent::Completed { attempt, .. } => ("completed", attempt),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        lifecycle,
        [
            ("claimed", 1),
            ("retry-scheduled", 1),
            ("claimed", 2),
            ("completed", 2)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_drains_then_releases() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(
        &queue,
        config()
            .with_concurrency(3)
            .with_drain_timeout(Duration::from_secs(5)),
        &observer,
    )
    .start()
    .unwrap();

    let quick = enqueue(&handle, Task::sleeping(1_000)).await;
    let slower = enqueue(&handle, Task::sleeping(2_000)).await;
    let stuck = enqueue(&handle, Task::sleeping(60_000)).await;
    wait_until(&handle, |stats| stats.active == 3).await;

    let report = handle.stop().await.unwrap();

    assert_eq!(
        report,
        ShutdownReport {
            drained: 2,
            released: 1
        }
    );
    for id in [&quick, &slower] {
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    let job = queue.get_job(&stuck).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts_made, 0);
    assert!(job.errors.is_empty());
    assert!(queue.jobs_with_status(JobStatus::Active).unwrap().is_empty());
    assert!(queue
        .jobs_with_status(JobStatus::DeadLettered)
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn panics_and_timeouts_are_retryable_failures() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(
        &queue,
        config().with_job_timeout(Duration::from_secs(1)),
        &observer,
    )
    .start()
    .unwrap();

    let panics = handle
        .job::<TaskHandler>()
        .with_payload(Task {
            panic: true,
            ..Task::default()
        })
        .with_max_attempts(2)
        .enqueue(handle.queue())
        .await
        .unwrap();
    let hangs = handle
        .job::<TaskHandler>()
        .with_payload(Task::sleeping(3_600_000))
        .with_max_attempts(1)
        .enqueue(handle.queue())
        .await
        .unwrap();
    wait_until(&handle, |stats| stats.dead_lettered == 2).await;

    let entry = handle.dead_letters().get(&panics).await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Exhausted);
    assert_eq!(entry.attempts_made, 2);
    assert_eq!(entry.error.error_type, ErrorType::Panic);
    assert_eq!(entry.error.details, "handler exploded");

    let entry = handle.dead_letters().get(&hangs).await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Exhausted);
    assert_eq!(entry.error.error_type, ErrorType::Timeout);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn job_claimed_past_its_ceiling_is_dead_lettered_unexecuted() {
    let queue = InMemoryQueue::new().with_lease_timeout(Duration::from_secs(1));
    let id = queue
        .enqueue(EnqueuableJob {
            kind: TaskHandler::KIND.to_owned(),
            payload: serde_json::to_value(Task::default()).unwrap(),
            max_attempts: 1,
            delay: Duration::ZERO,
        })
        .await
        .unwrap();
    // A consumer that claimed the job and vanished.
    queue.claim_next(TaskHandler::KIND).await.unwrap().unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let observer = Observer::default();
    let handle = pool(&queue, config(), &observer).start().unwrap();
    wait_until(&handle, |stats| stats.dead_lettered == 1).await;

    assert_eq!(observer.calls.load(Ordering::SeqCst), 0);
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempts_made, 1);
    let entry = handle.dead_letters().get(&id).await.unwrap().unwrap();
    assert_eq!(entry.error.error_type, ErrorType::Exhausted);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn claim_errors_are_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut queue = MockQueueClient::new();
    queue.expect_claim_next().returning({
        let calls = calls.clone();
        move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(QueueError::Unavailable("connection reset".to_owned()))
            } else {
                Ok(None)
            }
        }
    });
    let handle = WorkerPool::new(queue, InMemoryDeadLetterStore::new(), config().with_concurrency(1))
        .with_handler(TaskHandler {
            observer: Observer::default(),
        })
        .start()
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(calls.load(Ordering::SeqCst) >= 4);
    assert_eq!(handle.stats(), PoolStats::default());
    assert_eq!(handle.stop().await.unwrap(), ShutdownReport::default());
}

#[tokio::test(start_paused = true)]
async fn events_stream_follows_the_job() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = pool(&queue, config(), &observer).start().unwrap();
    let events = handle.events();
    tokio::pin!(events);

    let id = enqueue(&handle, Task::default()).await;

    assert_matches!(events.next().await, Some(JobEvent::Claimed { job_id, attempt: 1, .. }) if job_id == id);
    assert_matches!(events.next().await, Some(JobEvent::Progress { percent: 100, .. }));
    assert_matches!(events.next().await, Some(JobEvent::Completed { usage: Some(_), .. }));
    handle.stop().await.unwrap();
}

#[test]
fn start_requires_a_handler() {
    let result = WorkerPool::new(
        InMemoryQueue::new(),
        InMemoryDeadLetterStore::new(),
        PoolConfig::default(),
    )
    .start();
    assert_matches!(result, Err(TaskmillError::NoHandlers));
}

#[test]
fn start_validates_config() {
    let result = pool(
        &InMemoryQueue::new(),
        PoolConfig::default().with_concurrency(0),
        &Observer::default(),
    )
    .start();
    assert_matches!(result, Err(TaskmillError::Config(_)));
}

#[test]
fn job_builder_uses_configured_attempts() {
    let pool = pool(
        &InMemoryQueue::new(),
        PoolConfig::default().with_max_attempts("task", 9),
        &Observer::default(),
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let id = runtime
        .block_on(pool.job::<TaskHandler>().enqueue(pool.queue()))
        .unwrap();
    let job = runtime
        .block_on(pool.queue().get_job(&id))
        .unwrap()
        .unwrap();
    assert_eq!(job.max_attempts, 9);
}

/// Delays returning the claim of jobs marked `slow_claim`.
struct SlowClaims(InMemoryQueue);

#[async_trait]
impl QueueClient for SlowClaims {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError> {
        self.0.enqueue(job).await
    }

    async fn claim_next(&self, kind: &str) -> Result<Option<Job>, QueueError> {
        let job = self.0.claim_next(kind).await?;
        if job
            .as_ref()
            .is_some_and(|job| job.payload["slow_claim"] == true)
        {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(job)
    }

    async fn ack(
        &self,
        id: &JobId,
        lease: LeaseToken,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.0.ack(id, lease, result).await
    }

    async fn release(
        &self,
        id: &JobId,
        lease: LeaseToken,
        delay: Duration,
        release: Release,
    ) -> Result<(), QueueError> {
        self.0.release(id, lease, delay, release).await
    }

    async fn move_to_dead_letter(
        &self,
        id: &JobId,
        lease: LeaseToken,
        error: JobError,
    ) -> Result<(), QueueError> {
        self.0.move_to_dead_letter(id, lease, error).await
    }

    async fn update_progress(
        &self,
        id: &JobId,
        lease: LeaseToken,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.0.update_progress(id, lease, progress).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.0.get_job(id).await
    }

    async fn requeue(&self, id: &JobId) -> Result<(), QueueError> {
        self.0.requeue(id).await
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        self.0.cancel(id).await
    }
}

#[tokio::test(start_paused = true)]
async fn jobs_claimed_while_stopping_are_not_counted_as_drained() {
    let queue = InMemoryQueue::new();
    let observer = Observer::default();
    let handle = WorkerPool::new(
        SlowClaims(queue.clone()),
        InMemoryDeadLetterStore::new(),
        config()
            .with_concurrency(2)
            .with_drain_timeout(Duration::from_secs(5)),
    )
    .with_handler(TaskHandler {
        observer: observer.clone(),
    })
    .start()
    .unwrap();

    let running = enqueue(&handle, Task::sleeping(2_000)).await;
    wait_until(&handle, |stats| stats.active == 1).await;
    let late = enqueue(
        &handle,
        Task {
            slow_claim: true,
            ..Task::default()
        },
    )
    .await;
    while queue.get_job(&late).await.unwrap().unwrap().status != JobStatus::Active {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = handle.stop().await.unwrap();

    assert_eq!(
        report,
        ShutdownReport {
            drained: 1,
            released: 1
        }
    );
    let job = queue.get_job(&running).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let job = queue.get_job(&late).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_dead_letter_store_still_dead_letters_the_job() {
    let queue = InMemoryQueue::new();
    let mut store = MockDeadLetterStore::new();
    store
        .expect_upsert()
        .returning(|_| Err(DeadLetterError::Store("disk full".to_owned())));
    store.expect_get().returning(|_| Ok(None));
    store.expect_remove().returning(|_| Ok(false));
    let recorder = InMemoryRecorder::new();
    let handle = WorkerPool::new(queue.clone(), store, config())
        .with_handler(TaskHandler {
            observer: Observer::default(),
        })
        .with_recorder(recorder.clone())
        .start()
        .unwrap();
    let mut events = handle.subscribe();

    let id = enqueue(
        &handle,
        Task {
            fail_attempts: 1,
            permanent: true,
            ..Task::default()
        },
    )
    .await;
    wait_until(&handle, |stats| stats.dead_lettered == 1).await;

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|event| matches!(
        event,
        JobEvent::DeadLettered {
            reason: DeadLetterReason::Permanent,
            ..
        }
    )));

    let entry = handle.dead_letters().replay(&id).await.unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Permanent);
    assert_eq!(entry.error.error_type, ErrorType::from("validation"));
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    handle.stop().await.unwrap();
    let samples = recorder.samples().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].outcome, Outcome::Failed);
}

/// A real claim from a scratch queue, served by a mock.
async fn claimed(task: Task) -> Job {
    let scratch = InMemoryQueue::new();
    scratch
        .enqueue(EnqueuableJob {
            kind: TaskHandler::KIND.to_owned(),
            payload: serde_json::to_value(task).unwrap(),
            max_attempts: 3,
            delay: Duration::ZERO,
        })
        .await
        .unwrap();
    scratch.claim_next(TaskHandler::KIND).await.unwrap().unwrap()
}

fn serving(job: Job) -> MockQueueClient {
    let mut queue = MockQueueClient::new();
    let job = Mutex::new(Some(job));
    queue
        .expect_claim_next()
        .returning(move |_| Ok(job.lock().unwrap().take()));
    queue.expect_update_progress().returning(|_, _, _| Ok(()));
    queue
}

#[tokio::test(start_paused = true)]
async fn transient_ack_failures_are_retried() {
    let mut queue = serving(claimed(Task::default()).await);
    let acks = Arc::new(AtomicUsize::new(0));
    queue.expect_ack().returning({
        let acks = acks.clone();
        move |_, _, _| {
            if acks.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(QueueError::Unavailable("connection reset".to_owned()))
            } else {
                Ok(())
            }
        }
    });
    let handle = WorkerPool::new(queue, InMemoryDeadLetterStore::new(), config())
        .with_handler(TaskHandler {
            observer: Observer::default(),
        })
        .start()
        .unwrap();

    wait_until(&handle, |stats| stats.completed == 1).await;

    assert_eq!(acks.load(Ordering::SeqCst), 2);
    assert_eq!(handle.stats().active, 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_release_failures_are_retried() {
    let mut queue = serving(claimed(Task::failing(1)).await);
    let releases = Arc::new(AtomicUsize::new(0));
    queue.expect_release().returning({
        let releases = releases.clone();
        move |_, _, _, release| {
            assert_matches!(release, Release::Retry(_));
            if releases.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(QueueError::Unavailable("connection reset".to_owned()))
            } else {
                Ok(())
            }
        }
    });
    let handle = WorkerPool::new(queue, InMemoryDeadLetterStore::new(), config())
        .with_handler(TaskHandler {
            observer: Observer::default(),
        })
        .start()
        .unwrap();

    wait_until(&handle, |stats| stats.retried == 1).await;

    assert_eq!(releases.load(Ordering::SeqCst), 3);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_lease_drops_the_outcome() {
    let mut queue = serving(claimed(Task::failing(1)).await);
    let releases = Arc::new(AtomicUsize::new(0));
    queue.expect_release().returning({
        let releases = releases.clone();
        move |id, _, _, _| {
            releases.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::LeaseLost(id.clone()))
        }
    });
    let recorder = InMemoryRecorder::new();
    let handle = WorkerPool::new(queue, InMemoryDeadLetterStore::new(), config())
        .with_handler(TaskHandler {
            observer: Observer::default(),
        })
        .with_recorder(recorder.clone())
        .start()
        .unwrap();
    let mut events = handle.subscribe();

    while releases.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(handle.stats().retried, 0);
    assert_eq!(handle.stats().active, 0);
    assert!(std::iter::from_fn(|| events.try_recv().ok())
        .all(|event| !matches!(event, JobEvent::RetryScheduled { .. })));
    handle.stop().await.unwrap();
    assert!(recorder.samples().unwrap().is_empty());
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Hooked {
    panic_in_timeout: bool,
}

#[derive(Clone, Copy)]
enum BackoffHook {
    Zero,
    Panic,
}

/// Fails its first attempt, with user hooks that misbehave.
struct HookedHandler {
    backoff: BackoffHook,
}

#[async_trait]
impl JobHandler for HookedHandler {
    type Payload = Hooked;
    const KIND: &'static str = "hooked";

    async fn execute(
        &self,
        _hooked: Self::Payload,
        progress: Progress,
    ) -> Result<Completion, ClassifiedError> {
        if progress.attempt() == 1 {
            return Err(ClassifiedError::transient("provider", "provider overloaded"));
        }
        Ok(Completion::new(serde_json::json!(progress.attempt())))
    }

    fn timeout(&self, hooked: &Self::Payload) -> Option<Duration> {
        if hooked.panic_in_timeout {
            panic!("timeout hook exploded");
        }
        None
    }

    fn backoff(&self, _attempts_made: u16) -> Option<Duration> {
        match self.backoff {
            BackoffHook::Zero => Some(Duration::ZERO),
            BackoffHook::Panic => panic!("backoff hook exploded"),
        }
    }
}

fn hooked_pool(queue: &InMemoryQueue, backoff: BackoffHook) -> PoolHandle {
    WorkerPool::new(
        queue.clone(),
        InMemoryDeadLetterStore::new(),
        config().with_concurrency(1),
    )
    .with_handler(HookedHandler { backoff })
    .start()
    .unwrap()
}

async fn enqueue_hooked(handle: &PoolHandle, hooked: Hooked, max_attempts: u16) -> JobId {
    handle
        .job::<HookedHandler>()
        .with_payload(hooked)
        .with_max_attempts(max_attempts)
        .enqueue(handle.queue())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn panicking_timeout_hook_fails_the_attempt_and_keeps_the_slot() {
    let queue = InMemoryQueue::new();
    let handle = hooked_pool(&queue, BackoffHook::Zero);

    let bad = enqueue_hooked(
        &handle,
        Hooked {
            panic_in_timeout: true,
        },
        1,
    )
    .await;
    let good = enqueue_hooked(&handle, Hooked::default(), 2).await;
    wait_until(&handle, |stats| stats.dead_lettered == 1 && stats.completed == 1).await;

    let entry = handle.dead_letters().get(&bad).await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::Exhausted);
    assert_eq!(entry.error.error_type, ErrorType::Panic);
    assert_eq!(entry.error.details, "timeout hook exploded");
    let job = queue.get_job(&good).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(handle.stats().active, 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_backoff_hook_still_schedules_a_retry() {
    let queue = InMemoryQueue::new();
    let handle = hooked_pool(&queue, BackoffHook::Panic);

    let id = enqueue_hooked(&handle, Hooked::default(), 2).await;
    wait_until(&handle, |stats| stats.completed == 1).await;

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].error_type, ErrorType::Panic);
    assert_eq!(handle.stats().retried, 1);
    assert_eq!(handle.stats().active, 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_handler_backoff_is_floored() {
    let queue = InMemoryQueue::new();
    let handle = hooked_pool(&queue, BackoffHook::Zero);
    let mut events = handle.subscribe();

    enqueue_hooked(&handle, Hooked::default(), 2).await;
    wait_until(&handle, |stats| stats.completed == 1).await;

    let delays: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            JobEvent::RetryScheduled { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, [Duration::from_millis(1)]);
    handle.stop().await.unwrap();
}
