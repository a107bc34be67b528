//! Structured events describing what happens to each job attempt.
//!
//! The consumer loop is the only writer. Observers subscribe through
//! [`crate::PoolHandle::subscribe`] or [`crate::PoolHandle::events`]. A lagging observer misses
//! events. The metrics task receives its own unbounded copy of every attempt outcome.
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::{
    dead_letter::DeadLetterReason,
    handler::Usage,
    job::{JobError, JobId},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JobEvent {
    Claimed {
        job_id: JobId,
        kind: String,
        attempt: u16,
    },
    Progress {
        job_id: JobId,
        kind: String,
        attempt: u16,
        percent: u8,
    },
    Completed {
        job_id: JobId,
        kind: String,
        attempt: u16,
        duration: Duration,
        usage: Option<Usage>,
    },
    RetryScheduled {
        job_id: JobId,
        kind: String,
        attempt: u16,
        duration: Duration,
        delay: Duration,
        error: JobError,
    },
    DeadLettered {
        job_id: JobId,
        kind: String,
        attempt: u16,
        duration: Duration,
        reason: DeadLetterReason,
        error: JobError,
    },
    /// Handed back unacknowledged during shutdown.
    Released {
        job_id: JobId,
        kind: String,
        attempt: u16,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Claimed { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Released { job_id, .. } => job_id,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Claimed { kind, .. }
            | Self::Progress { kind, .. }
            | Self::Completed { kind, .. }
            | Self::RetryScheduled { kind, .. }
            | Self::DeadLettered { kind, .. }
            | Self::Released { kind, .. } => kind,
        }
    }

    /// Whether this event concludes an attempt that ran.
    pub fn is_attempt_outcome(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::RetryScheduled { .. } | Self::DeadLettered { .. }
        )
    }
}

const OBSERVER_CAPACITY: usize = 1_024;

#[derive(Clone, Debug)]
pub(crate) struct EventBus {
    observers: broadcast::Sender<JobEvent>,
    metrics: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventBus {
    pub(crate) fn new(metrics: Option<mpsc::UnboundedSender<JobEvent>>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self { observers, metrics }
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        if let Some(metrics) = &self.metrics {
            if event.is_attempt_outcome() {
                let _ = metrics.send(event.clone());
            }
        }
        // No receivers is fine.
        let _ = self.observers.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.observers.subscribe()
    }
}
