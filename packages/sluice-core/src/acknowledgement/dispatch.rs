//! Chunking and ordering of acknowledgement executions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;

use super::{AcknowledgementExecutor, AcknowledgementOrdering, AcknowledgementResultCallback};
use crate::error::AcknowledgementError;
use crate::message::{Message, QueueIdentity};

const ORDERED_KEY: &str = "__ordered__";
const DEFAULT_GROUP: &str = "__default__";

/// Partitions acknowledgements into executor-sized chunks and issues them
/// under the configured ordering discipline.
///
/// Ordered disciplines chain executions per key: each new execution first
/// awaits the shared tail future of its key, so call N+1 is never issued
/// before call N completed, across `dispatch` invocations. Completed tails
/// are pruned on the next dispatch.
pub(crate) struct AckDispatcher<T> {
    inner: Arc<DispatchInner<T>>,
}

impl<T> Clone for AckDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for AckDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckDispatcher")
            .field("ordering", &self.inner.ordering)
            .field("max_per_batch", &self.inner.max_per_batch)
            .finish()
    }
}

struct DispatchInner<T> {
    executor: Arc<dyn AcknowledgementExecutor<T>>,
    ordering: AcknowledgementOrdering,
    max_per_batch: usize,
    queue: QueueIdentity,
    result_callback: Option<Arc<dyn AcknowledgementResultCallback<T>>>,
    tails: Mutex<HashMap<String, Shared<BoxFuture<'static, ()>>>>,
}

impl<T: Clone + Send + Sync + 'static> AckDispatcher<T> {
    pub(crate) fn new(
        executor: Arc<dyn AcknowledgementExecutor<T>>,
        ordering: AcknowledgementOrdering,
        max_per_batch: usize,
        queue: QueueIdentity,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback<T>>>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                executor,
                ordering,
                max_per_batch: max_per_batch.max(1),
                queue,
                result_callback,
                tails: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Sends the given messages to the executor, chunked and ordered.
    /// Resolves once every resulting execution completed; the first failure
    /// becomes the result.
    pub(crate) async fn dispatch(
        &self,
        messages: Vec<Message<T>>,
    ) -> Result<(), AcknowledgementError> {
        if messages.is_empty() {
            return Ok(());
        }
        match self.inner.ordering {
            AcknowledgementOrdering::Parallel => {
                let chunks = partition(messages, self.inner.max_per_batch);
                let executions = chunks
                    .into_iter()
                    .map(|chunk| execute_chunk(self.inner.clone(), chunk));
                let results = futures::future::join_all(executions).await;
                results.into_iter().collect()
            }
            AcknowledgementOrdering::Ordered => {
                self.dispatch_chained(messages, |_| ORDERED_KEY.to_owned())
                    .await
            }
            AcknowledgementOrdering::OrderedByGroup => {
                self.dispatch_chained(messages, group_key).await
            }
        }
    }

    async fn dispatch_chained(
        &self,
        messages: Vec<Message<T>>,
        key_of: impl Fn(&Message<T>) -> String,
    ) -> Result<(), AcknowledgementError> {
        // Group first, preserving arrival order within and across groups.
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Message<T>>> = HashMap::new();
        for message in messages {
            let key = key_of(&message);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(message);
        }

        let mut receivers = Vec::new();
        {
            // Single lock scope: chunks of one dispatch enter each chain
            // back-to-back, in submission order.
            let mut tails = self.inner.tails.lock().unwrap();
            tails.retain(|_, tail| tail.peek().is_none());
            for key in order {
                let group = groups.remove(&key).unwrap_or_default();
                for chunk in partition(group, self.inner.max_per_batch) {
                    let previous = tails.get(&key).cloned();
                    let inner = self.inner.clone();
                    let (tx, rx) = oneshot::channel();
                    let task = tokio::spawn(async move {
                        if let Some(previous) = previous {
                            previous.await;
                        }
                        let result = execute_chunk(inner, chunk).await;
                        let _ = tx.send(result);
                    });
                    let tail: Shared<BoxFuture<'static, ()>> = async move {
                        let _ = task.await;
                    }
                    .boxed()
                    .shared();
                    tails.insert(key.clone(), tail);
                    receivers.push(rx);
                }
            }
        }

        let mut outcome = Ok(());
        for receiver in receivers {
            let result = receiver
                .await
                .unwrap_or_else(|_| Err(AcknowledgementError::interrupted(self.inner.queue.clone())));
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

async fn execute_chunk<T: Clone + Send + Sync + 'static>(
    inner: Arc<DispatchInner<T>>,
    chunk: Vec<Message<T>>,
) -> Result<(), AcknowledgementError> {
    let result = inner.executor.execute(chunk.clone()).await;
    match &result {
        Ok(()) => {
            if let Some(callback) = &inner.result_callback {
                callback.on_success(&chunk).await;
            }
        }
        Err(error) => {
            tracing::error!(
                queue = %inner.queue,
                count = chunk.len(),
                %error,
                "acknowledgement execution failed"
            );
            if let Some(callback) = &inner.result_callback {
                callback.on_failure(&chunk, error).await;
            }
        }
    }
    result
}

fn group_key<T>(message: &Message<T>) -> String {
    message
        .group()
        .map(|g| g.as_str().to_owned())
        .unwrap_or_else(|| DEFAULT_GROUP.to_owned())
}

fn partition<T>(messages: Vec<Message<T>>, max: usize) -> Vec<Vec<Message<T>>> {
    let mut chunks = Vec::new();
    let mut iter = messages.into_iter();
    loop {
        let chunk: Vec<Message<T>> = iter.by_ref().take(max).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::message::AckHandle;

    struct RecordingExecutor {
        calls: std::sync::Mutex<Vec<Vec<AckHandle>>>,
        delay_first: Option<Duration>,
        started: std::sync::Mutex<Vec<tokio::time::Instant>>,
    }

    impl RecordingExecutor {
        fn new(delay_first: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                delay_first,
                started: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AcknowledgementExecutor<u32> for RecordingExecutor {
        async fn execute(&self, messages: Vec<Message<u32>>) -> Result<(), AcknowledgementError> {
            let first = {
                let mut started = self.started.lock().unwrap();
                started.push(tokio::time::Instant::now());
                started.len() == 1
            };
            if first {
                if let Some(delay) = self.delay_first {
                    tokio::time::sleep(delay).await;
                }
            }
            self.calls
                .lock()
                .unwrap()
                .push(messages.iter().map(|m| m.ack_handle().clone()).collect());
            Ok(())
        }
    }

    fn dispatcher(
        executor: Arc<RecordingExecutor>,
        ordering: AcknowledgementOrdering,
        max_per_batch: usize,
    ) -> AckDispatcher<u32> {
        AckDispatcher::new(
            executor,
            ordering,
            max_per_batch,
            QueueIdentity::new("orders", "https://broker.local/orders"),
            None,
        )
    }

    fn batch(prefix: &str, count: usize) -> Vec<Message<u32>> {
        (0..count)
            .map(|i| Message::new(i as u32, format!("{prefix}-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn partitions_preserving_order() {
        let executor = RecordingExecutor::new(None);
        let dispatcher = dispatcher(executor.clone(), AcknowledgementOrdering::Ordered, 10);

        dispatcher.dispatch(batch("r", 15)).await.unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 10);
        assert_eq!(calls[1].len(), 5);
        assert_eq!(calls[0][0], AckHandle::new("r-0"));
        assert_eq!(calls[1][0], AckHandle::new("r-10"));
        assert_eq!(calls[1][4], AckHandle::new("r-14"));
    }

    #[tokio::test]
    async fn ordered_serializes_across_dispatches() {
        let executor = RecordingExecutor::new(Some(Duration::from_millis(50)));
        let dispatcher = Arc::new(dispatcher(
            executor.clone(),
            AcknowledgementOrdering::Ordered,
            10,
        ));

        let first = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(batch("b1", 3)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(batch("b2", 3)).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // The second batch's call was not issued until the first completed.
        assert_eq!(calls[0][0], AckHandle::new("b1-0"));
        assert_eq!(calls[1][0], AckHandle::new("b2-0"));
        let started = executor.started.lock().unwrap();
        assert!(started[1] >= started[0] + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn groups_proceed_concurrently() {
        struct GateExecutor {
            release_a: AsyncMutex<Option<tokio::sync::oneshot::Receiver<()>>>,
            calls: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl AcknowledgementExecutor<u32> for GateExecutor {
            async fn execute(
                &self,
                messages: Vec<Message<u32>>,
            ) -> Result<(), AcknowledgementError> {
                let group = messages[0]
                    .group()
                    .map(|g| g.as_str().to_owned())
                    .unwrap_or_default();
                if group == "a" {
                    if let Some(gate) = self.release_a.lock().await.take() {
                        let _ = gate.await;
                    }
                }
                self.calls.lock().unwrap().push(group);
                Ok(())
            }
        }

        let (open_a, gate_a) = tokio::sync::oneshot::channel();
        let executor = Arc::new(GateExecutor {
            release_a: AsyncMutex::new(Some(gate_a)),
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let dispatcher = AckDispatcher::new(
            executor.clone(),
            AcknowledgementOrdering::OrderedByGroup,
            10,
            QueueIdentity::new("orders", "url"),
            None,
        );

        // Group "a" is gated; group "b" must complete without waiting for it.
        let messages = vec![
            Message::new(1, "a-1").with_group("a"),
            Message::new(2, "b-1").with_group("b"),
        ];
        let dispatch = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(messages).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(executor.calls.lock().unwrap().clone(), vec!["b".to_owned()]);

        open_a.send(()).unwrap();
        dispatch.await.unwrap().unwrap();
        assert_eq!(
            executor.calls.lock().unwrap().clone(),
            vec!["b".to_owned(), "a".to_owned()]
        );
    }
}
