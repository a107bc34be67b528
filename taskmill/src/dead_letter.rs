//! Durable record of jobs that failed permanently.
//!
//! [`DeadLetterSink`] is the single place a job is terminally failed. It records a
//! [`DeadLetterEntry`] in a [`DeadLetterStore`] and then moves the job to the dead-lettered
//! state in the queue. Both steps are idempotent, keyed by job id, so a failed bury can simply
//! be retried and never produces a second entry.
//!
//! The queue record is authoritative. A job that reached the dead-lettered state while the
//! store was unreachable has no entry, and [`DeadLetterSink::replay`] rebuilds one from the
//! queue.
//!
//! The sink is also the operator surface: entries can be listed, inspected, summarised and
//! replayed back into the queue.
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    job::{Job, JobError, JobId, JobStatus},
    queue::{QueueClient, QueueError},
};

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// A retryable failure on the final attempt.
    Exhausted,
    /// A failure the handler marked as non-retryable.
    Permanent,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub reason: DeadLetterReason,
    /// The failure that ended the job.
    pub error: JobError,
    pub attempts_made: u16,
    pub max_attempts: u16,
    /// Every recorded failure, the final one included.
    pub history: Vec<JobError>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, reason: DeadLetterReason, error: JobError) -> Self {
        let mut history = job.errors.clone();
        history.push(error.clone());
        Self {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            reason,
            error,
            attempts_made: job.attempts_made.min(job.max_attempts),
            max_attempts: job.max_attempts,
            history,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Rebuilds the entry of a job the queue holds as dead-lettered.
    pub fn from_dead_lettered(job: &Job) -> Option<Self> {
        if job.status != JobStatus::DeadLettered {
            return None;
        }
        let error = job.errors.last()?.clone();
        let reason = if job.attempts_made >= job.max_attempts {
            DeadLetterReason::Exhausted
        } else {
            DeadLetterReason::Permanent
        };
        Some(Self {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            reason,
            error,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            history: job.errors.clone(),
            dead_lettered_at: job.dead_lettered_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Filter and page through dead-letter entries, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterQuery {
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DeadLetterQuery {
    fn default() -> Self {
        Self {
            kind: None,
            since: None,
            until: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl DeadLetterQuery {
    pub const DEFAULT_LIMIT: usize = 50;

    pub fn for_kind(self, kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..self
        }
    }

    pub fn since(self, since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..self
        }
    }

    pub fn until(self, until: DateTime<Utc>) -> Self {
        Self {
            until: Some(until),
            ..self
        }
    }

    pub fn page(self, limit: usize, offset: usize) -> Self {
        Self {
            limit,
            offset,
            ..self
        }
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.kind.as_ref().map_or(true, |kind| &entry.kind == kind)
            && self.since.map_or(true, |since| entry.dead_lettered_at >= since)
            && self.until.map_or(true, |until| entry.dead_lettered_at < until)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_error_type: BTreeMap<String, usize>,
    pub by_reason: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl DeadLetterStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>) -> Self {
        entries.into_iter().fold(Self::default(), |mut stats, entry| {
            stats.total += 1;
            *stats.by_kind.entry(entry.kind.clone()).or_default() += 1;
            *stats
                .by_error_type
                .entry(entry.error.error_type.to_string())
                .or_default() += 1;
            *stats
                .by_reason
                .entry(entry.reason.to_string())
                .or_default() += 1;
            let at = entry.dead_lettered_at;
            stats.oldest = Some(stats.oldest.map_or(at, |oldest| oldest.min(at)));
            stats.newest = Some(stats.newest.map_or(at, |newest| newest.max(at)));
            stats
        })
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("No dead-letter entry for {0}")]
    NotFound(JobId),
    #[error("Job {0} has no active lease")]
    MissingLease(JobId),
    #[error("Error communicating with the queue")]
    Queue(#[from] QueueError),
    #[error("Dead-letter store unavailable: {0}")]
    Store(String),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
}

/// Persistence for dead-letter entries. Entries are keyed by job id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Inserts `entry`, replacing any entry for the same job.
    async fn upsert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;

    async fn get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError>;

    async fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, DeadLetterError>;

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError>;

    /// Returns whether an entry was removed.
    async fn remove(&self, id: &JobId) -> Result<bool, DeadLetterError>;

    /// Removes every entry, returning how many there were.
    async fn purge(&self) -> Result<u64, DeadLetterError>;
}

/// Moves jobs to the dead-letter store and serves queries over it.
#[derive(Clone)]
pub struct DeadLetterSink {
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn DeadLetterStore>,
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink").finish_non_exhaustive()
    }
}

impl DeadLetterSink {
    pub fn new(queue: Arc<dyn QueueClient>, store: Arc<dyn DeadLetterStore>) -> Self {
        Self { queue, store }
    }

    /// Terminally fails an active job.
    ///
    /// The job must carry the lease of its current claim.
    pub async fn bury(
        &self,
        job: &Job,
        reason: DeadLetterReason,
        error: JobError,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        let lease = job
            .lease
            .ok_or_else(|| DeadLetterError::MissingLease(job.id.clone()))?;
        let entry = DeadLetterEntry::from_job(job, reason, error.clone());
        self.store.upsert(entry.clone()).await?;
        match self.queue.move_to_dead_letter(&job.id, lease, error).await {
            Ok(()) => Ok(entry),
            Err(err @ (QueueError::LeaseLost(_) | QueueError::JobNotFound(_))) => {
                // Another worker owns the job now, so the entry must not outlive this attempt.
                if let Err(remove_err) = self.store.remove(&job.id).await {
                    tracing::error!(
                        job_id = %job.id,
                        ?remove_err,
                        "Failed to remove the entry of {} after losing its lease",
                        job.id
                    );
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Puts a dead-lettered job back in the queue with a fresh attempt budget and removes its
    /// entry.
    pub async fn replay(&self, id: &JobId) -> Result<DeadLetterEntry, DeadLetterError> {
        let entry = match self.store.get(id).await? {
            Some(entry) => entry,
            None => self
                .queue
                .get_job(id)
                .await?
                .as_ref()
                .and_then(DeadLetterEntry::from_dead_lettered)
                .ok_or_else(|| DeadLetterError::NotFound(id.clone()))?,
        };
        self.queue.requeue(id).await?;
        self.store.remove(id).await?;
        tracing::info!(job_id = %id, kind = entry.kind, "Replayed dead-lettered job {id}");
        Ok(entry)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        query: &DeadLetterQuery,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.store.list(query).await
    }

    pub async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        self.store.stats().await
    }

    /// Drops every entry. Jobs stay dead-lettered in the queue.
    pub async fn purge(&self) -> Result<u64, DeadLetterError> {
        let purged = self.store.purge().await?;
        tracing::warn!(purged, "Purged {purged} dead-letter entries");
        Ok(purged)
    }
}

/// An in memory implementation of [`DeadLetterStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<RwLock<Vec<DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<DeadLetterEntry>>, DeadLetterError> {
        self.entries.read().map_err(|_| DeadLetterError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<DeadLetterEntry>>, DeadLetterError> {
        self.entries.write().map_err(|_| DeadLetterError::BadState)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn upsert(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut entries = self.write()?;
        match entries.iter_mut().find(|e| e.job_id == entry.job_id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        Ok(self.read()?.iter().find(|e| &e.job_id == id).cloned())
    }

    async fn list(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let entries = self.read()?;
        let mut matching: Vec<_> = entries.iter().filter(|e| query.matches(e)).collect();
        matching.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        Ok(DeadLetterStats::from_entries(self.read()?.iter()))
    }

    async fn remove(&self, id: &JobId) -> Result<bool, DeadLetterError> {
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|e| &e.job_id != id);
        Ok(entries.len() != before)
    }

    async fn purge(&self) -> Result<u64, DeadLetterError> {
        let mut entries = self.write()?;
        let purged = entries.len() as u64;
        entries.clear();
        Ok(purged)
    }
}
