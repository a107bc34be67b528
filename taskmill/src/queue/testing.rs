//! Test suite for ensuring a correct implementation of a [`QueueClient`].
use std::time::Duration;

use chrono::Utc;

use super::*;
use crate::job::ErrorType;

const DEFAULT_KIND: &str = "generate";

impl EnqueuableJob {
    #[doc(hidden)]
    pub fn mock_job() -> Self {
        Self {
            kind: DEFAULT_KIND.to_owned(),
            payload: serde_json::json!({ "prompt": "data" }),
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }

    #[doc(hidden)]
    pub fn with_kind(self, kind: impl ToString) -> Self {
        Self {
            kind: kind.to_string(),
            ..self
        }
    }

    #[doc(hidden)]
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }
}

impl JobError {
    #[doc(hidden)]
    pub fn mock_error(attempt: u16) -> Self {
        Self {
            attempt,
            error_type: ErrorType::Other("custom".to_owned()),
            details: "Error Message".to_owned(),
            recorded_at: Utc::now(),
        }
    }
}

/// Create test suite for a taskmill queue client.
///
/// Queue implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use taskmill::queue_suite;
/// use taskmill::queue::memory::InMemoryQueue;
/// queue_suite!(for: InMemoryQueue::new());
/// ```
///
/// A different async test attribute can be supplied, for example `sqlx::test`:
///
/// ```ignore
/// use taskmill::queue_suite;
/// queue_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     queue: PgQueue::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! queue_suite {
    (for: $queue:expr) => {
        $crate::queue_suite!(attr: tokio::test, args: (), queue: $queue);
    };
    (attr: $attr:meta, args: $args:tt, queue: $queue:expr) => {
        #[$attr]
        async fn enqueue_assigns_distinct_ids $args {
          let queue = $queue;
          $crate::queue::testing::enqueue_assigns_distinct_ids(queue).await;
        }
        #[$attr]
        async fn claim_next_only_claims_matching_kind $args {
          let queue = $queue;
          $crate::queue::testing::claim_next_only_claims_matching_kind(queue).await;
        }
        #[$attr]
        async fn claim_next_increments_attempts_and_issues_lease $args {
          let queue = $queue;
          $crate::queue::testing::claim_next_increments_attempts_and_issues_lease(queue).await;
        }
        #[$attr]
        async fn claim_next_never_hands_out_a_job_twice $args {
          let queue = $queue;
          $crate::queue::testing::claim_next_never_hands_out_a_job_twice(queue).await;
        }
        #[$attr]
        async fn claim_next_in_insertion_order $args {
          let queue = $queue;
          $crate::queue::testing::claim_next_in_insertion_order(queue).await;
        }
        #[$attr]
        async fn ack_completes_job $args {
          let queue = $queue;
          $crate::queue::testing::ack_completes_job(queue).await;
        }
        #[$attr]
        async fn ack_with_stale_lease $args {
          let queue = $queue;
          $crate::queue::testing::ack_with_stale_lease(queue).await;
        }
        #[$attr]
        async fn ack_not_found $args {
          let queue = $queue;
          $crate::queue::testing::ack_not_found(queue).await;
        }
        #[$attr]
        async fn release_for_retry_records_error $args {
          let queue = $queue;
          $crate::queue::testing::release_for_retry_records_error(queue).await;
        }
        #[$attr]
        async fn release_delays_next_claim $args {
          let queue = $queue;
          $crate::queue::testing::release_delays_next_claim(queue).await;
        }
        #[$attr]
        async fn release_interrupted_refunds_attempt $args {
          let queue = $queue;
          $crate::queue::testing::release_interrupted_refunds_attempt(queue).await;
        }
        #[$attr]
        async fn move_to_dead_letter_is_idempotent $args {
          let queue = $queue;
          $crate::queue::testing::move_to_dead_letter_is_idempotent(queue).await;
        }
        #[$attr]
        async fn update_progress_requires_lease $args {
          let queue = $queue;
          $crate::queue::testing::update_progress_requires_lease(queue).await;
        }
        #[$attr]
        async fn requeue_resets_attempts $args {
          let queue = $queue;
          $crate::queue::testing::requeue_resets_attempts(queue).await;
        }
        #[$attr]
        async fn requeue_rejects_live_jobs $args {
          let queue = $queue;
          $crate::queue::testing::requeue_rejects_live_jobs(queue).await;
        }
        #[$attr]
        async fn cancel_only_affects_waiting_jobs $args {
          let queue = $queue;
          $crate::queue::testing::cancel_only_affects_waiting_jobs(queue).await;
        }
    };
}

pub use queue_suite;

async fn claim(queue: &impl QueueClient) -> Job {
    queue
        .claim_next(DEFAULT_KIND)
        .await
        .unwrap()
        .expect("a job should be ready")
}

#[doc(hidden)]
pub async fn enqueue_assigns_distinct_ids(queue: impl QueueClient) {
    let id1 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);
    let job = queue.get_job(&id1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(queue.get_job(&id2).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn claim_next_only_claims_matching_kind(queue: impl QueueClient) {
    queue
        .enqueue(EnqueuableJob::mock_job().with_kind("another_kind"))
        .await
        .unwrap();
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = claim(&queue).await;
    assert_eq!(job.id, id);
    assert_eq!(job.kind, DEFAULT_KIND);
    assert!(queue.claim_next(DEFAULT_KIND).await.unwrap().is_none());
    assert!(queue.claim_next("missing").await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_increments_attempts_and_issues_lease(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = claim(&queue).await;
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.progress, 0);
    assert!(job.lease.is_some());
    assert!(job.attempted_at.is_some());

    let stored = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Active);
    assert_eq!(stored.attempts_made, 1);
}

#[doc(hidden)]
pub async fn claim_next_never_hands_out_a_job_twice(queue: impl QueueClient) {
    let id1 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let (first, second, third) = futures::join!(
        queue.claim_next(DEFAULT_KIND),
        queue.claim_next(DEFAULT_KIND),
        queue.claim_next(DEFAULT_KIND),
    );
    let mut claimed: Vec<_> = [first, second, third]
        .into_iter()
        .filter_map(|result| result.unwrap())
        .map(|job| job.id)
        .collect();
    claimed.sort();
    let mut expected = vec![id1, id2];
    expected.sort();
    assert_eq!(claimed, expected);
}

#[doc(hidden)]
pub async fn claim_next_in_insertion_order(queue: impl QueueClient) {
    let id1 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id3 = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let ids = [claim(&queue).await.id, claim(&queue).await.id, claim(&queue).await.id];
    assert_eq!(ids, [id1, id2, id3]);
}

#[doc(hidden)]
pub async fn ack_completes_job(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;

    queue
        .ack(&id, job.lease.unwrap(), serde_json::json!({ "text": "done" }))
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!({ "text": "done" })));
    assert_eq!(job.attempts_made, 1);
    assert!(job.completed_at.is_some());
    assert!(queue.claim_next(DEFAULT_KIND).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn ack_with_stale_lease(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;
    let lease = job.lease.unwrap();
    queue
        .release(&id, lease, Duration::ZERO, Release::Retry(JobError::mock_error(1)))
        .await
        .unwrap();

    let result = queue.ack(&id, lease, serde_json::Value::Null).await;
    assert!(matches!(result, Err(QueueError::LeaseLost(_))));
}

#[doc(hidden)]
pub async fn ack_not_found(queue: impl QueueClient) {
    let result = queue
        .ack(&JobId::new("0"), LeaseToken::from(1), serde_json::Value::Null)
        .await;
    assert!(matches!(result, Err(QueueError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn release_for_retry_records_error(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;

    queue
        .release(&id, job.lease.unwrap(), Duration::ZERO, Release::Retry(JobError::mock_error(1)))
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::RetryScheduled);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].attempt, 1);
    assert!(job.lease.is_none());

    let job = claim(&queue).await;
    assert_eq!(job.id, id);
    assert_eq!(job.attempts_made, 2);
}

#[doc(hidden)]
pub async fn release_delays_next_claim(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;

    queue
        .release(
            &id,
            job.lease.unwrap(),
            Duration::from_secs(3_600),
            Release::Retry(JobError::mock_error(1)),
        )
        .await
        .unwrap();

    assert!(queue.claim_next(DEFAULT_KIND).await.unwrap().is_none());
    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert!(job.scheduled_at > Utc::now());
}

#[doc(hidden)]
pub async fn release_interrupted_refunds_attempt(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;

    queue
        .release(&id, job.lease.unwrap(), Duration::ZERO, Release::Interrupted)
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts_made, 0);
    assert!(job.errors.is_empty());

    let job = claim(&queue).await;
    assert_eq!(job.attempts_made, 1);
}

#[doc(hidden)]
pub async fn move_to_dead_letter_is_idempotent(queue: impl QueueClient) {
    let id = queue
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    let job = claim(&queue).await;
    let lease = job.lease.unwrap();

    queue
        .move_to_dead_letter(&id, lease, JobError::mock_error(1))
        .await
        .unwrap();
    queue
        .move_to_dead_letter(&id, lease, JobError::mock_error(1))
        .await
        .unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLettered);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.errors.len(), 1);
    assert!(job.dead_lettered_at.is_some());
    assert!(queue.claim_next(DEFAULT_KIND).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn update_progress_requires_lease(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;
    let lease = job.lease.unwrap();

    queue.update_progress(&id, lease, 40).await.unwrap();
    assert_eq!(queue.get_job(&id).await.unwrap().unwrap().progress, 40);

    queue.ack(&id, lease, serde_json::Value::Null).await.unwrap();
    let result = queue.update_progress(&id, lease, 60).await;
    assert!(matches!(result, Err(QueueError::LeaseLost(_))));
}

#[doc(hidden)]
pub async fn requeue_resets_attempts(queue: impl QueueClient) {
    let id = queue
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    let job = claim(&queue).await;
    queue
        .move_to_dead_letter(&id, job.lease.unwrap(), JobError::mock_error(1))
        .await
        .unwrap();

    queue.requeue(&id).await.unwrap();

    let job = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.errors.len(), 1);
    let job = claim(&queue).await;
    assert_eq!(job.attempts_made, 1);
}

#[doc(hidden)]
pub async fn requeue_rejects_live_jobs(queue: impl QueueClient) {
    let id = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let result = queue.requeue(&id).await;
    assert!(matches!(
        result,
        Err(QueueError::InvalidTransition {
            status: JobStatus::Queued,
            ..
        })
    ));
    let result = queue.requeue(&JobId::new("0")).await;
    assert!(matches!(result, Err(QueueError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn cancel_only_affects_waiting_jobs(queue: impl QueueClient) {
    let waiting = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    assert!(queue.cancel(&waiting).await.unwrap());
    assert_eq!(
        queue.get_job(&waiting).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    let running = queue.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = claim(&queue).await;
    assert_eq!(job.id, running);
    assert!(!queue.cancel(&running).await.unwrap());
    assert!(queue.claim_next(DEFAULT_KIND).await.unwrap().is_none());
}
