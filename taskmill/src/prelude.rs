//! The purpose of this module is to alleviate the need to import many of the `[taskmill]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use taskmill::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::PoolConfig;
pub use crate::dead_letter::{DeadLetterQuery, DeadLetterReason};
pub use crate::events::JobEvent;
pub use crate::handler::{ClassifiedError, Completion, ExecutionError, JobHandler, Progress, Usage};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{ErrorType, Job, JobId, JobStatus};
pub use crate::queue::QueueClient;
pub use crate::{PoolHandle, WorkerPool};
