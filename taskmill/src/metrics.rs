//! Per attempt metrics.
//!
//! The pool turns every attempt outcome into an [`AttemptSample`] and hands it to a
//! [`MetricsRecorder`] from a dedicated task. Recording is fire and forget: a recorder that
//! errors or panics is logged and otherwise ignored.
//!
//! Two recorders are provided. [`FacadeRecorder`] forwards to whichever exporter is installed
//! for the [`metrics`] crate. [`InMemoryRecorder`] keeps recent samples for inspection.
use std::{
    collections::{BTreeMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    events::JobEvent,
    handler::Usage,
    job::ErrorType,
};

/// Metric names emitted by [`FacadeRecorder`].
pub mod names {
    pub const ATTEMPTS_TOTAL: &str = "taskmill_attempts_total";
    pub const ATTEMPT_DURATION_SECONDS: &str = "taskmill_attempt_duration_seconds";
    /// Value of `attempts_made` when the attempt concluded.
    pub const ATTEMPTS_MADE: &str = "taskmill_attempts_made";
    pub const USAGE_TOKENS_TOTAL: &str = "taskmill_usage_tokens_total";
    pub const USAGE_COST: &str = "taskmill_usage_cost";
}

/// Registers descriptions for every metric [`FacadeRecorder`] emits.
pub fn describe_metrics() {
    describe_counter!(
        names::ATTEMPTS_TOTAL,
        "Total number of job attempts by kind and outcome"
    );
    describe_histogram!(
        names::ATTEMPT_DURATION_SECONDS,
        "Job attempt duration in seconds"
    );
    describe_histogram!(
        names::ATTEMPTS_MADE,
        "Attempts made by a job when an attempt concluded"
    );
    describe_counter!(
        names::USAGE_TOKENS_TOTAL,
        "Total tokens reported by job handlers"
    );
    describe_histogram!(names::USAGE_COST, "Cost reported by job handlers");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSample {
    pub kind: String,
    pub outcome: Outcome,
    pub duration: Duration,
    pub attempts_made: u16,
    pub usage: Option<Usage>,
    pub error_type: Option<ErrorType>,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptSample {
    /// The sample for an attempt outcome event, `None` for any other event.
    pub fn from_event(event: &JobEvent) -> Option<Self> {
        let (kind, outcome, duration, attempts_made, usage, error_type) = match event {
            JobEvent::Completed {
                kind,
                attempt,
                duration,
                usage,
                ..
            } => (kind, Outcome::Success, *duration, *attempt, *usage, None),
            JobEvent::RetryScheduled {
                kind,
                attempt,
                duration,
                error,
                ..
            }
            | JobEvent::DeadLettered {
                kind,
                attempt,
                duration,
                error,
                ..
            } => (
                kind,
                Outcome::Failed,
                *duration,
                *attempt,
                None,
                Some(error.error_type.clone()),
            ),
            _ => return None,
        };
        Some(Self {
            kind: kind.clone(),
            outcome,
            duration,
            attempts_made,
            usage,
            error_type,
            recorded_at: Utc::now(),
        })
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Metrics recorder unavailable: {0}")]
    Unavailable(String),
    #[error("System in bad state")]
    BadState,
}

/// A sink for attempt samples.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsRecorder: Send + Sync + 'static {
    fn record(&self, sample: &AttemptSample) -> Result<(), RecorderError>;
}

/// Records through the [`metrics`] facade.
///
/// Without an installed exporter every call is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeRecorder;

impl MetricsRecorder for FacadeRecorder {
    fn record(&self, sample: &AttemptSample) -> Result<(), RecorderError> {
        let kind = sample.kind.clone();
        let outcome = sample.outcome.as_str();
        counter!(names::ATTEMPTS_TOTAL, "kind" => kind.clone(), "outcome" => outcome).increment(1);
        histogram!(names::ATTEMPT_DURATION_SECONDS, "kind" => kind.clone(), "outcome" => outcome)
            .record(sample.duration.as_secs_f64());
        histogram!(names::ATTEMPTS_MADE, "kind" => kind.clone())
            .record(f64::from(sample.attempts_made));
        if let Some(usage) = sample.usage {
            counter!(names::USAGE_TOKENS_TOTAL, "kind" => kind.clone()).increment(usage.tokens);
            histogram!(names::USAGE_COST, "kind" => kind).record(usage.cost);
        }
        Ok(())
    }
}

/// Aggregate over a set of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tally {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_duration: Duration,
    pub usage: Usage,
}

impl Tally {
    fn add(&mut self, sample: &AttemptSample) {
        self.total += 1;
        match sample.outcome {
            Outcome::Success => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
        }
        self.total_duration += sample.duration;
        if let Some(usage) = sample.usage {
            self.usage += usage;
        }
    }

    /// Fraction of successful attempts, `0.0` when empty.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    pub fn average_duration(&self) -> Duration {
        u32::try_from(self.total)
            .ok()
            .filter(|total| *total > 0)
            .map(|total| self.total_duration / total)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub overall: Tally,
    pub by_kind: BTreeMap<String, Tally>,
}

const DEFAULT_CAPACITY: usize = 10_000;

/// Keeps the most recent samples in memory.
#[derive(Debug, Clone)]
pub struct InMemoryRecorder {
    samples: Arc<Mutex<VecDeque<AttemptSample>>>,
    capacity: usize,
}

impl Default for InMemoryRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` samples, discarding the oldest.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Default::default(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<AttemptSample>>, RecorderError> {
        self.samples.lock().map_err(|_| RecorderError::BadState)
    }

    /// Aggregates the samples recorded within `window`, or all retained samples.
    pub fn snapshot(&self, window: Option<Duration>) -> Result<MetricsSnapshot, RecorderError> {
        let since = window
            .and_then(|window| TimeDelta::from_std(window).ok())
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let samples = self.lock()?;
        let mut snapshot = MetricsSnapshot::default();
        for sample in samples
            .iter()
            .filter(|sample| since.map_or(true, |since| sample.recorded_at >= since))
        {
            snapshot.overall.add(sample);
            snapshot
                .by_kind
                .entry(sample.kind.clone())
                .or_default()
                .add(sample);
        }
        Ok(snapshot)
    }

    /// The latest `limit` samples, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AttemptSample>, RecorderError> {
        Ok(self.lock()?.iter().rev().take(limit).cloned().collect())
    }

    /// Every retained sample in recording order.
    pub fn samples(&self) -> Result<Vec<AttemptSample>, RecorderError> {
        Ok(self.lock()?.iter().cloned().collect())
    }
}

impl MetricsRecorder for InMemoryRecorder {
    fn record(&self, sample: &AttemptSample) -> Result<(), RecorderError> {
        let mut samples = self.lock()?;
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample.clone());
        Ok(())
    }
}

/// Feeds attempt outcomes from `events` to `recorder`.
///
/// Stops once every sender is gone, or once `flush` is cancelled and the events already sent
/// have been recorded.
pub(crate) fn spawn_recorder(
    mut events: mpsc::UnboundedReceiver<JobEvent>,
    recorder: Arc<dyn MetricsRecorder>,
    flush: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut flushing = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => record(recorder.as_ref(), &event),
                    None => break,
                },
                _ = flush.cancelled(), if !flushing => {
                    events.close();
                    flushing = true;
                }
            }
        }
        tracing::debug!("Metrics recorder stopped");
    })
}

fn record(recorder: &dyn MetricsRecorder, event: &JobEvent) {
    let Some(sample) = AttemptSample::from_event(event) else {
        return;
    };
    let job_id = event.job_id();
    match std::panic::catch_unwind(AssertUnwindSafe(|| recorder.record(&sample))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::warn!(
            ?error,
            %job_id,
            kind = sample.kind,
            "Failed to record metrics for {job_id}, error: {error}",
        ),
        Err(_) => tracing::error!(
            %job_id,
            kind = sample.kind,
            "Metrics recorder panicked recording {job_id}",
        ),
    }
}
