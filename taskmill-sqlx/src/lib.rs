//! Postgres implementations of the taskmill [`QueueClient`](taskmill::queue::QueueClient) and
//! [`DeadLetterStore`](taskmill::dead_letter::DeadLetterStore).
//!
//! ```no_run
//! # use taskmill::prelude::*;
//! use taskmill_sqlx::{PgDeadLetterStore, PgQueue};
//! use sqlx::PgPool;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgres://localhost/taskmill").await?;
//! let queue = PgQueue::from_pool(pool.clone()).await?;
//! let dead_letters = PgDeadLetterStore::from_pool(pool).await?;
//! let pool = WorkerPool::new(queue, dead_letters, PoolConfig::default());
//! # Ok(())
//! # }
//! ```
use sqlx::migrate::Migrator;

mod dead_letter;
mod queue;
mod types;

pub use dead_letter::PgDeadLetterStore;
pub use queue::PgQueue;

/// The schema both tables live in. Applied by the `from_pool` constructors.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
