//! An asynchronous job execution engine.
//!
//! Taskmill is the consumer side of a job queue. A [`WorkerPool`] claims jobs from a
//! [`QueueClient`](queue::QueueClient), runs them through the [`JobHandler`](handler::JobHandler)
//! registered for their kind, and resolves each attempt:
//!
//! - success acknowledges the job,
//! - a retryable failure with attempts remaining releases it for redelivery after a
//!   [backoff](backoff) delay,
//! - anything else moves it to the [dead-letter store](dead_letter).
//!
//! Concurrency is bounded by the number of worker slots and dispatch frequency by a sliding
//! window [rate limiter](rate_limit). Every attempt outcome is published as a
//! [`JobEvent`](events::JobEvent) and recorded by a [`MetricsRecorder`](metrics::MetricsRecorder).
//!
//! # Example
//!
//! ```
//! use taskmill::prelude::*;
//! use taskmill::{dead_letter::InMemoryDeadLetterStore, queue::memory::InMemoryQueue};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Prompt {
//!     text: String,
//! }
//!
//! struct GenerateHandler;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for GenerateHandler {
//!     type Payload = Prompt;
//!     const KIND: &'static str = "generate";
//!
//!     async fn execute(
//!         &self,
//!         payload: Self::Payload,
//!         progress: Progress,
//!     ) -> Result<Completion, ClassifiedError> {
//!         progress.report(50).await;
//!         Ok(Completion::new(serde_json::json!({ "echo": payload.text })))
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
//! let pool = WorkerPool::new(
//!     InMemoryQueue::new(),
//!     InMemoryDeadLetterStore::new(),
//!     PoolConfig::default().with_concurrency(2),
//! )
//! .with_handler(GenerateHandler);
//!
//! let handle = pool.start().unwrap();
//! handle
//!     .job::<GenerateHandler>()
//!     .with_payload(Prompt { text: "hello".to_owned() })
//!     .enqueue(handle.queue())
//!     .await
//!     .unwrap();
//!
//! handle.stop().await.unwrap();
//! # });
//! ```
use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod events;
pub mod handler;
pub mod job;
pub mod metrics;
mod pool;
pub mod prelude;
pub mod queue;
pub mod rate_limit;
pub mod testing;

pub use pool::{PoolHandle, PoolStats, ShutdownReport, WorkerPool};

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("Invalid configuration")]
    Config(#[from] config::ConfigError),
    #[error("Error communicating with the queue")]
    Queue(#[from] queue::QueueError),
    #[error("Error accessing the dead-letter store")]
    DeadLetter(#[from] dead_letter::DeadLetterError),
    #[error("Invalid job: {0}")]
    InvalidJob(&'static str),
    #[error("No job handlers registered")]
    NoHandlers,
    #[error("Failed to gracefully shut down")]
    ShutdownFailed,
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}
