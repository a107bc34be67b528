//! Provides an in memory implementation of [`QueueClient`].
//!
//! It is a correct but unoptimised implementation meant for tests, demos and single process
//! setups. Readiness and lease expiry are measured on the tokio clock so that tests running with
//! paused time observe retry delays without really waiting.
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

use super::{EnqueuableJob, QueueClient, QueueError, Release};
use crate::job::{Job, JobError, JobId, JobStatus, LeaseToken};

/// An in memory implementation of [`QueueClient`].
///
/// Cloning is cheap and clones share the same jobs.
#[derive(Clone, Debug)]
pub struct InMemoryQueue {
    records: Arc<RwLock<Vec<Record>>>,
    id_counter: Arc<AtomicU64>,
    lease_counter: Arc<AtomicI64>,
    lease_timeout: Option<Duration>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
struct Record {
    job: Job,
    seq: u64,
    ready_at: Instant,
    lease_expires_at: Option<Instant>,
}

impl Record {
    fn is_ready(&self, kind: &str, now: Instant) -> bool {
        if self.job.kind != kind {
            return false;
        }
        match self.job.status {
            JobStatus::Queued | JobStatus::RetryScheduled => self.ready_at <= now,
            JobStatus::Active => self.lease_expires_at.is_some_and(|expiry| expiry <= now),
            _ => false,
        }
    }

    fn check_lease(&self, lease: LeaseToken) -> Result<(), QueueError> {
        if self.job.status == JobStatus::Active && self.job.lease == Some(lease) {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(self.job.id.clone()))
        }
    }
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            records: Default::default(),
            id_counter: Arc::new(AtomicU64::new(1)),
            lease_counter: Arc::new(AtomicI64::new(1)),
            lease_timeout: None,
        }
    }

    /// Active jobs whose claim is older than `timeout` become claimable again.
    ///
    /// Without a lease timeout a job abandoned by a crashed consumer stays active forever.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    /// All jobs currently held, in insertion order.
    pub fn jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.read()?.iter().map(|record| record.job.clone()).collect())
    }

    /// Jobs currently in `status`.
    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .read()?
            .iter()
            .filter(|record| record.job.status == status)
            .map(|record| record.job.clone())
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Record>>, QueueError> {
        self.records.read().map_err(|_| QueueError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Record>>, QueueError> {
        self.records.write().map_err(|_| QueueError::BadState)
    }

    fn with_record<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Record) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut records = self.write()?;
        let record = records
            .iter_mut()
            .find(|record| &record.job.id == id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        f(record)
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError> {
        let seq = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let id = JobId::new(seq.to_string());
        let now = Utc::now();
        let record = Record {
            seq,
            ready_at: Instant::now() + job.delay,
            lease_expires_at: None,
            job: Job {
                id: id.clone(),
                kind: job.kind,
                payload: job.payload,
                status: JobStatus::Queued,
                attempts_made: 0,
                max_attempts: job.max_attempts,
                progress: 0,
                result: None,
                errors: vec![],
                lease: None,
                inserted_at: now,
                scheduled_at: wall_clock_after(job.delay),
                attempted_at: None,
                completed_at: None,
                dead_lettered_at: None,
                cancelled_at: None,
            },
        };
        self.write()?.push(record);
        Ok(id)
    }

    async fn claim_next(&self, kind: &str) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let mut records = self.write()?;
        let Some(record) = records
            .iter_mut()
            .filter(|record| record.is_ready(kind, now))
            .min_by_key(|record| (record.ready_at, record.seq))
        else {
            return Ok(None);
        };

        let lease = LeaseToken::from(self.lease_counter.fetch_add(1, Ordering::SeqCst));
        record.lease_expires_at = self.lease_timeout.map(|timeout| now + timeout);
        let job = &mut record.job;
        job.status = JobStatus::Active;
        job.attempts_made = job.attempts_made.saturating_add(1);
        job.progress = 0;
        job.lease = Some(lease);
        job.attempted_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn ack(
        &self,
        id: &JobId,
        lease: LeaseToken,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.with_record(id, |record| {
            record.check_lease(lease)?;
            record.lease_expires_at = None;
            let job = &mut record.job;
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result = Some(result);
            job.lease = None;
            job.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn release(
        &self,
        id: &JobId,
        lease: LeaseToken,
        delay: Duration,
        release: Release,
    ) -> Result<(), QueueError> {
        self.with_record(id, |record| {
            record.check_lease(lease)?;
            record.lease_expires_at = None;
            record.ready_at = Instant::now() + delay;
            let job = &mut record.job;
            job.scheduled_at = wall_clock_after(delay);
            job.lease = None;
            match release {
                Release::Retry(error) => {
                    job.errors.push(error);
                    job.status = JobStatus::RetryScheduled;
                }
                Release::Interrupted => {
                    job.attempts_made = job.attempts_made.saturating_sub(1);
                    job.status = match job.attempts_made {
                        0 => JobStatus::Queued,
                        _ => JobStatus::RetryScheduled,
                    };
                }
            }
            Ok(())
        })
    }

    async fn move_to_dead_letter(
        &self,
        id: &JobId,
        lease: LeaseToken,
        error: JobError,
    ) -> Result<(), QueueError> {
        self.with_record(id, |record| {
            if record.job.status == JobStatus::DeadLettered {
                return Ok(());
            }
            record.check_lease(lease)?;
            record.lease_expires_at = None;
            let job = &mut record.job;
            job.attempts_made = job.attempts_made.min(job.max_attempts);
            job.errors.push(error);
            job.status = JobStatus::DeadLettered;
            job.lease = None;
            job.dead_lettered_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn update_progress(
        &self,
        id: &JobId,
        lease: LeaseToken,
        progress: u8,
    ) -> Result<(), QueueError> {
        self.with_record(id, |record| {
            record.check_lease(lease)?;
            record.job.progress = record.job.progress.max(progress.min(100));
            Ok(())
        })
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        Ok(self
            .read()?
            .iter()
            .find(|record| &record.job.id == id)
            .map(|record| record.job.clone()))
    }

    async fn requeue(&self, id: &JobId) -> Result<(), QueueError> {
        self.with_record(id, |record| {
            if record.job.status != JobStatus::DeadLettered {
                return Err(QueueError::InvalidTransition {
                    id: id.clone(),
                    status: record.job.status,
                });
            }
            record.ready_at = Instant::now();
            let job = &mut record.job;
            job.status = JobStatus::Queued;
            job.attempts_made = 0;
            job.progress = 0;
            job.scheduled_at = Utc::now();
            job.dead_lettered_at = None;
            Ok(())
        })
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        self.with_record(id, |record| {
            if !record.job.status.is_claimable() {
                return Ok(false);
            }
            record.job.status = JobStatus::Cancelled;
            record.job.cancelled_at = Some(Utc::now());
            Ok(true)
        })
    }
}
