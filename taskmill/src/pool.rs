//! The worker pool: a fixed number of slots claiming and running jobs.
//!
//! Each slot loops independently:
//!
//! 1. wait for a permit from the shared [`RateLimiter`],
//! 2. claim the next job, trying the registered kinds round robin,
//! 3. run it to completion and report the outcome to the queue.
//!
//! A permit that does not lead to a claim is refunded, so the limiter only counts dispatches.
//! The number of slots is the concurrency ceiling. A slot that panics is restarted.
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{FutureExt, Stream};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{BackoffStrategy, Exponential, Strategy},
    config::PoolConfig,
    dead_letter::{DeadLetterSink, DeadLetterStore},
    events::{EventBus, JobEvent},
    handler::{registry::Registry, JobHandler},
    job::{builder::JobBuilder, Job},
    metrics::{spawn_recorder, FacadeRecorder, MetricsRecorder},
    queue::{QueueClient, QueueError},
    rate_limit::RateLimiter,
    TaskmillError,
};

mod runner;
#[cfg(test)]
mod tests;

use runner::JobRunner;

/// Builds a pool. Nothing runs until [`WorkerPool::start`].
///
/// ```
/// # use taskmill::prelude::*;
/// # use taskmill::{dead_letter::InMemoryDeadLetterStore, queue::memory::InMemoryQueue};
/// # use std::time::Duration;
/// # struct Ping;
/// # #[async_trait::async_trait]
/// # impl JobHandler for Ping {
/// #     type Payload = ();
/// #     const KIND: &'static str = "ping";
/// #     async fn execute(&self, _: (), _: Progress) -> Result<Completion, ClassifiedError> {
/// #         Ok(Completion::new(serde_json::json!("pong")))
/// #     }
/// # }
/// # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
/// let config = PoolConfig::default()
///     .with_concurrency(5)
///     .with_rate_limit(20, Duration::from_secs(1));
/// let pool = WorkerPool::new(InMemoryQueue::new(), InMemoryDeadLetterStore::new(), config)
///     .with_handler(Ping);
/// pool.job::<Ping>().enqueue(pool.queue()).await.unwrap();
///
/// let handle = pool.start().unwrap();
/// let report = handle.stop().await.unwrap();
/// # assert_eq!(report.released, 0);
/// # });
/// ```
pub struct WorkerPool {
    queue: Arc<dyn QueueClient>,
    dead_letters: DeadLetterSink,
    registry: Registry,
    recorder: Arc<dyn MetricsRecorder>,
    config: PoolConfig,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new<Q, D>(queue: Q, dead_letters: D, config: PoolConfig) -> Self
    where
        Q: QueueClient + 'static,
        D: DeadLetterStore + 'static,
    {
        let queue: Arc<dyn QueueClient> = Arc::new(queue);
        Self {
            dead_letters: DeadLetterSink::new(queue.clone(), Arc::new(dead_letters)),
            queue,
            registry: Registry::default(),
            recorder: Arc::new(FacadeRecorder),
            config,
        }
    }

    pub fn with_handler<H: JobHandler>(mut self, handler: H) -> Self {
        self.registry.register(handler);
        self
    }

    /// Replaces the default [`FacadeRecorder`].
    pub fn with_recorder<R: MetricsRecorder>(mut self, recorder: R) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// A builder for a job of `H` using the attempt ceiling configured for its kind.
    pub fn job<H>(&self) -> JobBuilder<H>
    where
        H: JobHandler,
        H::Payload: Serialize,
    {
        JobBuilder::new().with_max_attempts(self.config.max_attempts_for(H::KIND))
    }

    pub fn queue(&self) -> &dyn QueueClient {
        self.queue.as_ref()
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    /// Spawns the slots onto the current tokio runtime.
    pub fn start(self) -> Result<PoolHandle, TaskmillError> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(TaskmillError::NoHandlers);
        }

        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let flush = CancellationToken::new();
        let recorder = spawn_recorder(metrics_rx, self.recorder, flush.clone());

        let shared = Arc::new(Shared {
            limiter: RateLimiter::new(self.config.rate_limit.max, self.config.rate_limit_window()),
            retry_backoff: self.config.retry_backoff(),
            broker_backoff: self.config.broker_backoff(),
            events: EventBus::new(Some(metrics_tx)),
            stats: Counters::default(),
            claiming: CancellationToken::new(),
            drain: CancellationToken::new(),
            queue: self.queue,
            dead_letters: self.dead_letters,
            registry: self.registry,
            config: self.config,
        });

        let mut slots = JoinSet::new();
        for slot in 0..shared.config.concurrency {
            slots.spawn(supervise_slot(shared.clone(), slot));
        }
        tracing::info!(
            concurrency = shared.config.concurrency,
            kinds = ?shared.registry.kinds(),
            "Started worker pool with {} slots",
            shared.config.concurrency,
        );

        Ok(PoolHandle {
            shared,
            slots,
            recorder,
            flush,
        })
    }
}

/// State shared by every slot.
pub(crate) struct Shared {
    queue: Arc<dyn QueueClient>,
    dead_letters: DeadLetterSink,
    registry: Registry,
    config: PoolConfig,
    limiter: RateLimiter,
    retry_backoff: BackoffStrategy<Exponential>,
    broker_backoff: BackoffStrategy<Exponential>,
    events: EventBus,
    stats: Counters,
    /// Cancelled to stop claiming.
    claiming: CancellationToken,
    /// Cancelled to interrupt jobs still running.
    drain: CancellationToken,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    peak_active: AtomicUsize,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
    /// Released jobs that had started running.
    interrupted: AtomicU64,
}

impl Counters {
    fn start_job(&self) -> ActiveJob<'_> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        ActiveJob(self)
    }

    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_released(&self, started: bool) {
        self.released.fetch_add(1, Ordering::SeqCst);
        if started {
            self.interrupted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

/// Counts a job as active until dropped, panics included.
struct ActiveJob<'a>(&'a Counters);

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counters since the pool started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Jobs currently held by a slot.
    pub active: usize,
    /// The highest value `active` has reached.
    pub peak_active: usize,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Jobs handed back unfinished during shutdown.
    pub released: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Jobs in flight at `stop` that finished before the drain timeout.
    pub drained: usize,
    /// Jobs released back to the queue unfinished, including any claimed after `stop`.
    pub released: usize,
}

/// A running pool.
///
/// Dropping the handle aborts every slot without releasing jobs, leaving them to lease expiry.
/// Use [`PoolHandle::stop`] to shut down gracefully.
pub struct PoolHandle {
    shared: Arc<Shared>,
    slots: JoinSet<()>,
    recorder: JoinHandle<()>,
    flush: CancellationToken,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("slots", &self.slots.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.shared.stats.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Events from now on as a stream. Events missed by a lagging consumer are skipped.
    pub fn events(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        let mut events = self.subscribe();
        async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event stream lagging, skipped {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn queue(&self) -> &dyn QueueClient {
        self.shared.queue.as_ref()
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.shared.dead_letters
    }

    pub fn job<H>(&self) -> JobBuilder<H>
    where
        H: JobHandler,
        H::Payload: Serialize,
    {
        JobBuilder::new().with_max_attempts(self.shared.config.max_attempts_for(H::KIND))
    }

    /// Stops claiming, waits up to the drain timeout for jobs in flight, then releases whatever
    /// is still running back to the queue.
    pub async fn stop(mut self) -> Result<ShutdownReport, TaskmillError> {
        let in_flight = self.shared.stats.active.load(Ordering::SeqCst);
        let released_before = self.shared.stats.released.load(Ordering::SeqCst);
        let interrupted_before = self.shared.stats.interrupted.load(Ordering::SeqCst);
        let drain_timeout = self.shared.config.drain_timeout();
        tracing::info!(in_flight, "Stopping worker pool, draining for {drain_timeout:?}");
        self.shared.claiming.cancel();

        let mut panicked = 0;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(result) = self.slots.join_next().await {
                panicked += usize::from(result.is_err());
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!("Drain timeout elapsed, releasing jobs still running");
            self.shared.drain.cancel();
            while let Some(result) = self.slots.join_next().await {
                panicked += usize::from(result.is_err());
            }
        }

        self.flush.cancel();
        self.recorder
            .await
            .map_err(|_| TaskmillError::ShutdownFailed)?;

        let released = self.shared.stats.released.load(Ordering::SeqCst) - released_before;
        let interrupted =
            self.shared.stats.interrupted.load(Ordering::SeqCst) - interrupted_before;
        let report = ShutdownReport {
            drained: in_flight.saturating_sub(interrupted as usize),
            released: released as usize,
        };
        if panicked > 0 {
            tracing::error!(panicked, "{panicked} worker slots panicked");
            return Err(TaskmillError::ShutdownFailed);
        }
        tracing::info!(
            drained = report.drained,
            released = report.released,
            "Worker pool stopped"
        );
        Ok(report)
    }
}

/// Restarts `run_slot` after a panic until the pool stops claiming.
async fn supervise_slot(shared: Arc<Shared>, slot: usize) {
    while let Err(panic) = AssertUnwindSafe(run_slot(shared.clone(), slot))
        .catch_unwind()
        .await
    {
        tracing::error!(slot, ?panic, "Worker slot {slot} panicked, restarting");
        if shared.claiming.is_cancelled() {
            break;
        }
    }
}

async fn run_slot(shared: Arc<Shared>, slot: usize) {
    let kinds = shared.registry.kinds();
    let mut next_kind = slot % kinds.len();
    let mut claim_failures: u16 = 0;

    loop {
        let permit = tokio::select! {
            biased;
            _ = shared.claiming.cancelled() => break,
            permit = shared.limiter.acquire() => permit,
        };

        match claim(&shared, kinds, &mut next_kind).await {
            Ok(Some(job)) => {
                claim_failures = 0;
                permit.commit();
                let _active = shared.stats.start_job();
                let runner = JobRunner::new(shared.clone());
                if shared.claiming.is_cancelled() {
                    // Claimed while stopping. Hand it straight back.
                    runner.release_unstarted(job).await;
                } else {
                    runner.run_supervised(job).await;
                }
            }
            Ok(None) => {
                claim_failures = 0;
                permit.refund();
                if !pause(&shared, shared.config.poll_interval()).await {
                    break;
                }
            }
            Err(error) => {
                permit.refund();
                let delay = shared.broker_backoff.backoff(claim_failures);
                claim_failures = claim_failures.saturating_add(1);
                tracing::warn!(
                    ?error,
                    slot,
                    "Failed to claim a job, retrying in {delay:?}, error: {error:?}"
                );
                if !pause(&shared, delay).await {
                    break;
                }
            }
        }
    }
    tracing::debug!(slot, "Worker slot {slot} stopped");
}

/// Tries each kind once, starting after the kind that was claimed last.
async fn claim(
    shared: &Shared,
    kinds: &[&'static str],
    next_kind: &mut usize,
) -> Result<Option<Job>, QueueError> {
    for _ in 0..kinds.len() {
        let kind = kinds[*next_kind];
        *next_kind = (*next_kind + 1) % kinds.len();
        if let Some(job) = shared.queue.claim_next(kind).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

/// Sleeps for `duration`, returning false if the pool stopped claiming in the meantime.
async fn pause(shared: &Shared, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shared.claiming.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
