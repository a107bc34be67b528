use std::{ops::Deref, time::Duration};

use async_trait::async_trait;
use sqlx::{postgres::PgQueryResult, PgPool};
use taskmill::{
    job::{Job, JobError, JobId, LeaseToken},
    queue::{EnqueuableJob, QueueClient, QueueError, Release},
};
use tracing::instrument;

use crate::{
    types::{self, queue_error, row_id, JobStatus},
    MIGRATOR,
};

/// A [`QueueClient`] backed by the `taskmill_jobs` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so any number of pools can consume from the same table.
#[derive(Clone, Debug)]
pub struct PgQueue {
    pool: PgPool,
    lease_timeout: Option<Duration>,
}

impl Deref for PgQueue {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgQueue {
    fn from(pool: PgPool) -> Self {
        Self {
            pool,
            lease_timeout: None,
        }
    }
}

impl From<&PgPool> for PgQueue {
    fn from(value: &PgPool) -> Self {
        value.to_owned().into()
    }
}

impl PgQueue {
    /// Wraps `pool`, running any pending migrations first.
    pub async fn from_pool(pool: PgPool) -> Result<Self, QueueError> {
        MIGRATOR.run(&pool).await.map_err(|error| {
            tracing::error!(?error, "Failed to migrate the taskmill schema: {error}");
            QueueError::BadState
        })?;
        Ok(pool.into())
    }

    /// Active jobs whose claim is older than `timeout` become claimable again.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    /// The current status of `id`, if it exists.
    async fn status_of(&self, id: i64) -> Result<Option<JobStatus>, QueueError> {
        sqlx::query_scalar::<_, JobStatus>("SELECT status FROM taskmill_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.deref())
            .await
            .map_err(queue_error)
    }

    /// Explains why an update guarded by a lease touched no rows.
    async fn guarded(
        &self,
        id: &JobId,
        row: i64,
        result: Result<PgQueryResult, sqlx::Error>,
    ) -> Result<(), QueueError> {
        if result.map_err(queue_error)?.rows_affected() > 0 {
            return Ok(());
        }
        match self.status_of(row).await? {
            Some(_) => Err(QueueError::LeaseLost(id.clone())),
            None => Err(QueueError::JobNotFound(id.clone())),
        }
    }
}

fn job_row(id: &JobId) -> Result<i64, QueueError> {
    row_id(id).ok_or_else(|| QueueError::JobNotFound(id.clone()))
}

#[async_trait]
impl QueueClient for PgQueue {
    #[instrument(skip(self, job), fields(kind = %job.kind))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError> {
        let id: i64 = sqlx::query_scalar(
            r#"INSERT INTO taskmill_jobs (kind, payload, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(i32::from(job.max_attempts))
        .bind(job.delay.as_secs_f64())
        .fetch_one(self.deref())
        .await
        .map_err(queue_error)?;
        Ok(JobId::new(id.to_string()))
    }

    async fn claim_next(&self, kind: &str) -> Result<Option<Job>, QueueError> {
        sqlx::query_as::<_, types::Job>(
            r#"UPDATE taskmill_jobs
            SET
                status = 'active',
                attempts_made = attempts_made + 1,
                progress = 0,
                lease = nextval('taskmill_lease_seq'),
                attempted_at = now()
            WHERE id = (
                SELECT id FROM taskmill_jobs
                WHERE kind = $1
                AND (
                    (status IN ('queued', 'retry-scheduled') AND scheduled_at <= now())
                    OR (
                        status = 'active'
                        AND $2::double precision IS NOT NULL
                        AND attempted_at <= now() - make_interval(secs => $2)
                    )
                )
                ORDER BY scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(kind)
        .bind(self.lease_timeout.map(|timeout| timeout.as_secs_f64()))
        .fetch_optional(self.deref())
        .await
        .map_err(queue_error)?
        .map(Job::try_from)
        .transpose()
    }

    async fn ack(
        &self,
        id: &JobId,
        lease: LeaseToken,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let row = job_row(id)?;
        let outcome = sqlx::query(
            r#"UPDATE taskmill_jobs
            SET
                status = 'completed',
                progress = 100,
                result = $3,
                lease = NULL,
                completed_at = now()
            WHERE id = $1 AND status = 'active' AND lease = $2
            "#,
        )
        .bind(row)
        .bind(i64::from(lease))
        .bind(result)
        .execute(self.deref())
        .await;
        self.guarded(id, row, outcome).await
    }

    async fn release(
        &self,
        id: &JobId,
        lease: LeaseToken,
        delay: Duration,
        release: Release,
    ) -> Result<(), QueueError> {
        let row = job_row(id)?;
        let outcome = match release {
            Release::Retry(error) => {
                sqlx::query(
                    r#"UPDATE taskmill_jobs
                    SET
                        status = 'retry-scheduled',
                        scheduled_at = now() + make_interval(secs => $3),
                        lease = NULL,
                        errors = ARRAY_APPEND(errors, $4)
                    WHERE id = $1 AND status = 'active' AND lease = $2
                    "#,
                )
                .bind(row)
                .bind(i64::from(lease))
                .bind(delay.as_secs_f64())
                .bind(serde_json::to_value(error)?)
                .execute(self.deref())
                .await
            }
            Release::Interrupted => {
                sqlx::query(
                    r#"UPDATE taskmill_jobs
                    SET
                        status = CASE
                            WHEN attempts_made <= 1 THEN 'queued'::taskmill_job_status
                            ELSE 'retry-scheduled'::taskmill_job_status
                        END,
                        attempts_made = GREATEST(attempts_made - 1, 0),
                        scheduled_at = now() + make_interval(secs => $3),
                        lease = NULL
                    WHERE id = $1 AND status = 'active' AND lease = $2
                    "#,
                )
                .bind(row)
                .bind(i64::from(lease))
                .bind(delay.as_secs_f64())
                .execute(self.deref())
                .await
            }
        };
        self.guarded(id, row, outcome).await
    }

    async fn move_to_dead_letter(
        &self,
        id: &JobId,
        lease: LeaseToken,
        error: JobError,
    ) -> Result<(), QueueError> {
        let row = job_row(id)?;
        let outcome = sqlx::query(
            r#"UPDATE taskmill_jobs
            SET
                status = 'dead-lettered',
                attempts_made = LEAST(attempts_made, max_attempts),
                lease = NULL,
                errors = ARRAY_APPEND(errors, $3),
                dead_lettered_at = now()
            WHERE id = $1 AND status = 'active' AND lease = $2
            "#,
        )
        .bind(row)
        .bind(i64::from(lease))
        .bind(serde_json::to_value(error)?)
        .execute(self.deref())
        .await
        .map_err(queue_error)?;
        if outcome.rows_affected() > 0 {
            return Ok(());
        }
        match self.status_of(row).await? {
            Some(JobStatus::DeadLettered) => Ok(()),
            Some(_) => Err(QueueError::LeaseLost(id.clone())),
            None => Err(QueueError::JobNotFound(id.clone())),
        }
    }

    async fn update_progress(
        &self,
        id: &JobId,
        lease: LeaseToken,
        progress: u8,
    ) -> Result<(), QueueError> {
        let row = job_row(id)?;
        let outcome = sqlx::query(
            r#"UPDATE taskmill_jobs
            SET progress = GREATEST(progress, $3)
            WHERE id = $1 AND status = 'active' AND lease = $2
            "#,
        )
        .bind(row)
        .bind(i64::from(lease))
        .bind(i16::from(progress.min(100)))
        .execute(self.deref())
        .await;
        self.guarded(id, row, outcome).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        let Some(row) = row_id(id) else {
            return Ok(None);
        };
        sqlx::query_as::<_, types::Job>("SELECT * FROM taskmill_jobs WHERE id = $1")
            .bind(row)
            .fetch_optional(self.deref())
            .await
            .map_err(queue_error)?
            .map(Job::try_from)
            .transpose()
    }

    async fn requeue(&self, id: &JobId) -> Result<(), QueueError> {
        let row = job_row(id)?;
        let outcome = sqlx::query(
            r#"UPDATE taskmill_jobs
            SET
                status = 'queued',
                attempts_made = 0,
                progress = 0,
                scheduled_at = now(),
                dead_lettered_at = NULL
            WHERE id = $1 AND status = 'dead-lettered'
            "#,
        )
        .bind(row)
        .execute(self.deref())
        .await
        .map_err(queue_error)?;
        if outcome.rows_affected() > 0 {
            return Ok(());
        }
        match self.status_of(row).await? {
            Some(status) => Err(QueueError::InvalidTransition {
                id: id.clone(),
                status: status.into(),
            }),
            None => Err(QueueError::JobNotFound(id.clone())),
        }
    }

    async fn cancel(&self, id: &JobId) -> Result<bool, QueueError> {
        let row = job_row(id)?;
        let outcome = sqlx::query(
            r#"UPDATE taskmill_jobs
            SET status = 'cancelled', cancelled_at = now()
            WHERE id = $1 AND status IN ('queued', 'retry-scheduled')
            "#,
        )
        .bind(row)
        .execute(self.deref())
        .await
        .map_err(queue_error)?;
        if outcome.rows_affected() > 0 {
            return Ok(true);
        }
        match self.status_of(row).await? {
            Some(_) => Ok(false),
            None => Err(QueueError::JobNotFound(id.clone())),
        }
    }
}
