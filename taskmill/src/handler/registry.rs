use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};

use super::{ClassifiedError, Completion, JobHandler, Progress};

/// An attempt ready to be spawned.
pub(crate) struct Dispatch {
    pub(crate) timeout: Option<Duration>,
    pub(crate) future: BoxFuture<'static, Result<Completion, ClassifiedError>>,
}

/// A [`JobHandler`] with its payload type erased.
pub(crate) trait ErasedHandler: Send + Sync {
    /// Decodes the payload and prepares the handler invocation.
    fn dispatch(
        &self,
        payload: serde_json::Value,
        progress: Progress,
    ) -> Result<Dispatch, ClassifiedError>;

    fn backoff(&self, attempts_made: u16) -> Option<Duration>;
}

struct Typed<H>(Arc<H>);

impl<H> ErasedHandler for Typed<H>
where
    H: JobHandler,
{
    fn dispatch(
        &self,
        payload: serde_json::Value,
        progress: Progress,
    ) -> Result<Dispatch, ClassifiedError> {
        let payload: H::Payload =
            serde_json::from_value(payload).map_err(ClassifiedError::decode)?;
        let timeout = self.0.timeout(&payload);
        let handler = self.0.clone();
        Ok(Dispatch {
            timeout,
            future: async move { handler.execute(payload, progress).await }.boxed(),
        })
    }

    fn backoff(&self, attempts_made: u16) -> Option<Duration> {
        self.0.backoff(attempts_made)
    }
}

/// Dispatch table from job kind to handler.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    kinds: Vec<&'static str>,
}

impl Registry {
    /// Registers `handler` for [`JobHandler::KIND`], replacing any previous registration.
    pub(crate) fn register<H: JobHandler>(&mut self, handler: H) {
        if self
            .handlers
            .insert(H::KIND, Arc::new(Typed(Arc::new(handler))))
            .is_some()
        {
            tracing::warn!(kind = H::KIND, "Replacing handler for {}", H::KIND);
        } else {
            self.kinds.push(H::KIND);
        }
    }

    pub(crate) fn get(&self, kind: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds in registration order.
    pub(crate) fn kinds(&self) -> &[&'static str] {
        &self.kinds
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("kinds", &self.kinds).finish()
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::{
        events::EventBus,
        job::{ErrorType, JobId, LeaseToken},
        queue::memory::InMemoryQueue,
    };

    #[derive(Deserialize)]
    struct Echo {
        text: String,
    }

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        type Payload = Echo;
        const KIND: &'static str = "echo";

        async fn execute(
            &self,
            payload: Self::Payload,
            _progress: Progress,
        ) -> Result<Completion, ClassifiedError> {
            Ok(Completion::new(serde_json::json!(payload.text)))
        }

        fn timeout(&self, payload: &Self::Payload) -> Option<Duration> {
            Some(Duration::from_secs(payload.text.len() as u64))
        }

        fn backoff(&self, attempts_made: u16) -> Option<Duration> {
            Some(Duration::from_millis(attempts_made.into()))
        }
    }

    fn progress() -> Progress {
        Progress::new(
            JobId::new("1"),
            "echo".to_owned(),
            1,
            LeaseToken::from(1),
            Arc::new(InMemoryQueue::new()),
            EventBus::new(None),
        )
    }

    #[tokio::test]
    async fn dispatches_decoded_payload() {
        let mut registry = Registry::default();
        registry.register(EchoHandler);

        let handler = registry.get("echo").unwrap();
        let dispatch = handler
            .dispatch(serde_json::json!({ "text": "hello" }), progress())
            .unwrap();

        assert_eq!(dispatch.timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            dispatch.future.await.unwrap(),
            Completion::new(serde_json::json!("hello"))
        );
        assert_eq!(handler.backoff(3), Some(Duration::from_millis(3)));
    }

    #[test]
    fn undecodable_payload_is_permanent() {
        let mut registry = Registry::default();
        registry.register(EchoHandler);

        let error = registry
            .get("echo")
            .unwrap()
            .dispatch(serde_json::json!({ "unexpected": 1 }), progress())
            .err()
            .unwrap();
        assert_eq!(error.error_type, ErrorType::Decode);
        assert!(!error.retryable);
    }

    #[test]
    fn registering_twice_keeps_one_kind() {
        let mut registry = Registry::default();
        registry.register(EchoHandler);
        registry.register(EchoHandler);

        assert_eq!(registry.kinds(), ["echo"]);
        assert!(registry.get("other").is_none());
    }
}
