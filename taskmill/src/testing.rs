//! Helpers for testing.

/// A macro for making assertions about the jobs held by an
/// [`InMemoryQueue`](crate::queue::memory::InMemoryQueue).
///
/// Jobs can be matched on status, kind, payload and attempts made. Without a count the assertion
/// is that exactly one job matches.
///
/// # Example
///
/// ```
/// # use taskmill::prelude::*;
/// # use taskmill::testing::assert_jobs;
/// # struct Generate;
/// # #[async_trait::async_trait]
/// # impl JobHandler for Generate {
/// #     type Payload = String;
/// #     const KIND: &'static str = "generate";
/// #     async fn execute(&self, _: String, _: Progress) -> Result<Completion, ClassifiedError> {
/// #         Ok(Completion::default())
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// use taskmill::queue::memory::InMemoryQueue;
/// let queue = InMemoryQueue::new();
///
/// JobBuilder::<Generate>::new()
///     .with_payload("a fox".to_owned())
///     .enqueue(&queue)
///     .await
///     .unwrap();
/// JobBuilder::<Generate>::new()
///     .with_payload("a hound".to_owned())
///     .enqueue(&queue)
///     .await
///     .unwrap();
///
/// assert_jobs!(
///     in: queue,
///     with_payload: "a fox",
///     for_handler: Generate
/// );
///
/// assert_jobs!(
///     2 jobs,
///     in: queue,
///     with_status: JobStatus::Queued,
///     for_kind: "generate",
/// );
///
/// assert_jobs!(0 jobs, in: queue, with_status: JobStatus::DeadLettered);
/// # });
/// ```
#[macro_export]
macro_rules! assert_jobs {
    (1 job, in: $queue:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal 1 in: $queue, $($tail)*);
    };
    ($n:literal jobs, in: $queue:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal $n in: $queue, $($tail)*);
    };
    (in: $queue:ident, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal 1 in: $queue, $($tail)*);
    };
    (@internal $n:literal in: $queue:ident, $($tail:tt)*) => {{
        let mut filters: Vec<Box<dyn Fn(&$crate::job::Job) -> bool>> = Vec::new();
        $crate::assert_jobs!(@filter filters; $($tail)*);
        let all_jobs = $queue.jobs().unwrap();
        let jobs: Vec<_> = all_jobs
            .iter()
            .filter(|job| filters.iter().all(|filter| filter(job)))
            .collect();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs {},\n\n\
            Expected {} jobs, found {} matching jobs:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@filter $vec:ident;) => {};
    (@filter $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        let status: $crate::job::JobStatus = $status;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.status == status));
        $($crate::assert_jobs!(@filter $vec; $($tail)*))?
    };
    (@filter $vec:ident; with_payload: $payload:expr $(, $($tail:tt)*)?) => {
        let payload = serde_json::to_value($payload).unwrap();
        $vec.push(Box::new(move |job: &$crate::job::Job| job.payload == payload));
        $($crate::assert_jobs!(@filter $vec; $($tail)*))?
    };
    (@filter $vec:ident; with_attempts: $attempts:expr $(, $($tail:tt)*)?) => {
        let attempts: u16 = $attempts;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.attempts_made == attempts));
        $($crate::assert_jobs!(@filter $vec; $($tail)*))?
    };
    (@filter $vec:ident; for_kind: $kind:literal $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|job: &$crate::job::Job| job.kind == $kind));
        $($crate::assert_jobs!(@filter $vec; $($tail)*))?
    };
    (@filter $vec:ident; for_handler: $handler:path $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|job: &$crate::job::Job| {
            job.kind == <$handler as $crate::handler::JobHandler>::KIND
        }));
        $($crate::assert_jobs!(@filter $vec; $($tail)*))?
    };
}

pub use assert_jobs;
