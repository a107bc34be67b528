//! The job record as seen by the consumer side of the queue.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod builder;

/// Opaque identifier assigned to a job by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Proof of ownership handed out with every claim.
///
/// Completing, releasing or dead-lettering a job requires the lease of the current claim. A
/// consumer holding a stale lease gets [`crate::queue::QueueError::LeaseLost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(i64);

impl From<i64> for LeaseToken {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<LeaseToken> for i64 {
    fn from(value: LeaseToken) -> Self {
        value.0
    }
}

impl Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lease({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Incremented by the queue each time the job is claimed.
    pub attempts_made: u16,
    pub max_attempts: u16,
    /// Percent complete of the current attempt.
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    /// One entry per failed attempt, oldest first.
    pub errors: Vec<JobError>,
    pub lease: Option<LeaseToken>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn attempts_remaining(&self) -> u16 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    RetryScheduled,
    DeadLettered,
    Cancelled,
}

impl JobStatus {
    /// Terminal jobs are never claimed again without manual intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered | Self::Cancelled)
    }

    /// Whether a job in this status may be handed out by a claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::RetryScheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::RetryScheduled => "retry-scheduled",
            Self::DeadLettered => "dead-lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub attempt: u16,
    pub error_type: ErrorType,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Panic,
    Timeout,
    /// The payload could not be decoded into the handler's input type.
    Decode,
    /// The job was claimed again after its attempts had already run out.
    Exhausted,
    #[serde(untagged)]
    Other(String),
}

impl ErrorType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::Decode => "decode",
            Self::Exhausted => "exhausted",
            Self::Other(other) => other,
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorType {
    fn from(value: &str) -> Self {
        match value {
            "panic" => Self::Panic,
            "timeout" => Self::Timeout,
            "decode" => Self::Decode,
            "exhausted" => Self::Exhausted,
            other => Self::Other(other.to_owned()),
        }
    }
}
