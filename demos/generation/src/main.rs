use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use taskmill::{
    dead_letter::InMemoryDeadLetterStore, metrics::InMemoryRecorder, prelude::*,
    queue::memory::InMemoryQueue,
};
use tracing_subscriber::EnvFilter;

const RUN_FOR: Duration = Duration::from_secs(20);

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let recorder = InMemoryRecorder::new();
    let config = PoolConfig::default()
        .with_concurrency(4)
        .with_rate_limit(5, Duration::from_secs(1))
        .with_backoff(Duration::from_millis(250), Duration::from_secs(2))
        .with_drain_timeout(Duration::from_secs(3));
    let handle = WorkerPool::new(InMemoryQueue::new(), InMemoryDeadLetterStore::new(), config)
        .with_handler(GenerationHandler)
        .with_recorder(recorder.clone())
        .start()
        .unwrap();

    for (index, prompt) in [
        "A haiku about queues",
        "Explain backpressure",
        "",
        "Summarise the plot of Hamlet",
        "A limerick about retries",
        "Translate 'dead letter' to French",
    ]
    .into_iter()
    .cycle()
    .take(24)
    .enumerate()
    {
        let job_id = handle
            .job::<GenerationHandler>()
            .with_payload(Prompt {
                text: prompt.to_owned(),
                words: 5 + index % 10,
            })
            .enqueue(handle.queue())
            .await
            .unwrap();
        println!("Inserted job {job_id}");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
        _ = tokio::time::sleep(RUN_FOR) => {},
    }

    let stats = handle.stats();
    let dead_letters = handle.dead_letters().clone();
    let report = handle.stop().await.unwrap();
    println!("Pool: {stats:?}");
    println!("Shutdown: {report:?}");

    let snapshot = recorder.snapshot(None).unwrap();
    println!(
        "Attempts: {}, success rate {:.0}%, average {:?}, tokens {}",
        snapshot.overall.total,
        snapshot.overall.success_rate() * 100.0,
        snapshot.overall.average_duration(),
        snapshot.overall.usage.tokens,
    );

    let dead = dead_letters.list(&DeadLetterQuery::default()).await.unwrap();
    for entry in dead {
        println!(
            "Dead letter {} ({}) after {} attempts: {}",
            entry.job_id, entry.reason, entry.attempts_made, entry.error.details
        );
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Prompt {
    text: String,
    words: usize,
}

#[derive(Debug, thiserror::Error)]
enum GenerationError {
    #[error("the model is overloaded")]
    Overloaded,
    #[error("an empty prompt cannot be completed")]
    EmptyPrompt,
}

impl ExecutionError for GenerationError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Overloaded => "overloaded",
            Self::EmptyPrompt => "validation",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded)
    }
}

struct GenerationHandler;

#[async_trait]
impl JobHandler for GenerationHandler {
    type Payload = Prompt;
    const KIND: &'static str = "generation";

    async fn execute(
        &self,
        prompt: Self::Payload,
        progress: Progress,
    ) -> Result<Completion, ClassifiedError> {
        if prompt.text.is_empty() {
            return Err(GenerationError::EmptyPrompt.into());
        }
        if rand::thread_rng().gen_bool(0.3) {
            return Err(GenerationError::Overloaded.into());
        }

        let mut text = Vec::with_capacity(prompt.words);
        for word in 0..prompt.words {
            tokio::time::sleep(Duration::from_millis(50)).await;
            text.push(format!("word{word}"));
            progress.report(((word + 1) * 100 / prompt.words) as u8).await;
        }

        Ok(
            Completion::new(serde_json::json!({ "text": text.join(" ") })).with_usage(Usage {
                tokens: (prompt.text.len() + prompt.words) as u64,
                cost: prompt.words as f64 * 0.0001,
            }),
        )
    }

    fn timeout(&self, prompt: &Self::Payload) -> Option<Duration> {
        Some(Duration::from_millis(100 * prompt.words as u64 + 500))
    }
}
