use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use taskmill::{
    dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterReason},
    job::{JobError, JobId, LeaseToken},
    queue::QueueError,
};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "taskmill_job_status", rename_all = "kebab-case")]
pub(crate) enum JobStatus {
    Queued,
    Active,
    Completed,
    RetryScheduled,
    DeadLettered,
    Cancelled,
}

impl From<JobStatus> for taskmill::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::Active => Self::Active,
            JobStatus::Completed => Self::Completed,
            JobStatus::RetryScheduled => Self::RetryScheduled,
            JobStatus::DeadLettered => Self::DeadLettered,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<taskmill::job::JobStatus> for JobStatus {
    fn from(value: taskmill::job::JobStatus) -> Self {
        match value {
            taskmill::job::JobStatus::Queued => Self::Queued,
            taskmill::job::JobStatus::Active => Self::Active,
            taskmill::job::JobStatus::Completed => Self::Completed,
            taskmill::job::JobStatus::RetryScheduled => Self::RetryScheduled,
            taskmill::job::JobStatus::DeadLettered => Self::DeadLettered,
            taskmill::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub progress: i16,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<serde_json::Value>,
    pub lease: Option<i64>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<Job> for taskmill::job::Job {
    type Error = QueueError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId::new(value.id.to_string()),
            kind: value.kind,
            payload: value.payload,
            status: value.status.into(),
            attempts_made: u16::try_from(value.attempts_made).map_err(|_| QueueError::BadState)?,
            max_attempts: u16::try_from(value.max_attempts).map_err(|_| QueueError::BadState)?,
            progress: u8::try_from(value.progress).map_err(|_| QueueError::BadState)?,
            result: value.result,
            errors: value
                .errors
                .into_iter()
                .map(serde_json::from_value::<JobError>)
                .collect::<Result<_, _>>()?,
            lease: value.lease.map(LeaseToken::from),
            inserted_at: value.inserted_at,
            scheduled_at: value.scheduled_at,
            attempted_at: value.attempted_at,
            completed_at: value.completed_at,
            dead_lettered_at: value.dead_lettered_at,
            cancelled_at: value.cancelled_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeadLetter {
    pub job_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub error: serde_json::Value,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub history: serde_json::Value,
    pub dead_lettered_at: DateTime<Utc>,
}

impl TryFrom<DeadLetter> for DeadLetterEntry {
    type Error = DeadLetterError;

    fn try_from(value: DeadLetter) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: JobId::new(value.job_id),
            kind: value.kind,
            payload: value.payload,
            reason: serde_json::from_value::<DeadLetterReason>(value.reason.into())?,
            error: serde_json::from_value(value.error)?,
            attempts_made: u16::try_from(value.attempts_made)
                .map_err(|_| DeadLetterError::BadState)?,
            max_attempts: u16::try_from(value.max_attempts)
                .map_err(|_| DeadLetterError::BadState)?,
            history: serde_json::from_value(value.history)?,
            dead_lettered_at: value.dead_lettered_at,
        })
    }
}

/// Row ids are integers. An id that does not parse names no row.
pub(crate) fn row_id(id: &JobId) -> Option<i64> {
    id.as_str().parse().ok()
}

pub(crate) fn queue_error(error: sqlx::Error) -> QueueError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => QueueError::Unavailable(error.to_string()),
        error => {
            tracing::error!(?error, "Unexpected database error: {error}");
            QueueError::BadState
        }
    }
}

pub(crate) fn store_error(error: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Store(error.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> Job {
        Job {
            id: 42,
            kind: "generate".to_owned(),
            payload: serde_json::json!({ "prompt": "hello" }),
            status: JobStatus::RetryScheduled,
            attempts_made: 2,
            max_attempts: 3,
            progress: 40,
            result: None,
            errors: vec![serde_json::json!({
                "attempt": 1,
                "error_type": "provider",
                "details": "provider overloaded",
                "recorded_at": "2024-06-01T12:00:00Z",
            })],
            lease: None,
            inserted_at: Utc::now(),
            scheduled_at: Utc::now(),
            attempted_at: Some(Utc::now()),
            completed_at: None,
            dead_lettered_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn job_row_converts() {
        let job = taskmill::job::Job::try_from(row()).unwrap();

        assert_eq!(job.id, JobId::new("42"));
        assert_eq!(job.status, taskmill::job::JobStatus::RetryScheduled);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].error_type.as_str(), "provider");
    }

    #[test]
    fn corrupt_rows_are_rejected() {
        let job = Job {
            attempts_made: -1,
            ..row()
        };
        assert!(matches!(
            taskmill::job::Job::try_from(job),
            Err(QueueError::BadState)
        ));

        let job = Job {
            errors: vec![serde_json::json!("not an error")],
            ..row()
        };
        assert!(matches!(
            taskmill::job::Job::try_from(job),
            Err(QueueError::EncodeDecode(_))
        ));
    }

    #[test]
    fn statuses_map_both_ways() {
        for status in [
            taskmill::job::JobStatus::Queued,
            taskmill::job::JobStatus::Active,
            taskmill::job::JobStatus::Completed,
            taskmill::job::JobStatus::RetryScheduled,
            taskmill::job::JobStatus::DeadLettered,
            taskmill::job::JobStatus::Cancelled,
        ] {
            assert_eq!(taskmill::job::JobStatus::from(JobStatus::from(status)), status);
        }
    }

    #[test]
    fn ids_must_be_numeric() {
        assert_eq!(row_id(&JobId::new("17")), Some(17));
        assert_eq!(row_id(&JobId::new("job-17")), None);
    }

    #[test]
    fn connection_errors_are_transient() {
        assert!(queue_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!queue_error(sqlx::Error::RowNotFound).is_transient());
    }
}
