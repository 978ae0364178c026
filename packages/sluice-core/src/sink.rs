//! Sinks: the entry point handing poll batches to the processing pipeline.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::{GroupKey, Message};
use crate::pipeline::{MessageProcessingPipeline, ProcessingContext};

/// Receives converted poll batches from the source and drives pipeline
/// invocations for them.
///
/// `emit` resolves once all processing for the batch completed. Sinks release
/// one backpressure permit per message as it finishes; pipeline failures are
/// logged here, never propagated, since acknowledgement and error handling
/// already ran inside the pipeline.
#[async_trait]
pub trait MessageSink<T: Send + Sync + 'static>: Send + Sync {
    /// Processes the given batch in the given context.
    async fn emit(&self, messages: Vec<Message<T>>, context: ProcessingContext<T>);
}

/// Runs one concurrent pipeline invocation per message.
pub struct FanOutMessageSink<T> {
    pipeline: Arc<MessageProcessingPipeline<T>>,
}

impl<T> FanOutMessageSink<T> {
    /// Creates a sink over the given pipeline.
    pub fn new(pipeline: Arc<MessageProcessingPipeline<T>>) -> Self {
        Self { pipeline }
    }
}

impl<T> fmt::Debug for FanOutMessageSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutMessageSink").finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageSink<T> for FanOutMessageSink<T> {
    async fn emit(&self, messages: Vec<Message<T>>, context: ProcessingContext<T>) {
        let mut invocations = Vec::with_capacity(messages.len());
        for message in messages {
            let pipeline = self.pipeline.clone();
            let context = context.clone();
            invocations.push(tokio::spawn(async move {
                let message_id = message.id();
                let outcome = pipeline.process(message, &context).await;
                context.release_backpressure();
                if let Err(failure) = outcome {
                    tracing::error!(
                        message_id = %message_id,
                        error = %failure.error(),
                        "error processing message"
                    );
                }
            }));
        }
        for invocation in invocations {
            let _ = invocation.await;
        }
    }
}

/// Runs pipeline invocations sequentially, in poll order.
pub struct OrderedMessageSink<T> {
    pipeline: Arc<MessageProcessingPipeline<T>>,
}

impl<T> OrderedMessageSink<T> {
    /// Creates a sink over the given pipeline.
    pub fn new(pipeline: Arc<MessageProcessingPipeline<T>>) -> Self {
        Self { pipeline }
    }
}

impl<T> fmt::Debug for OrderedMessageSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedMessageSink").finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageSink<T> for OrderedMessageSink<T> {
    async fn emit(&self, messages: Vec<Message<T>>, context: ProcessingContext<T>) {
        for message in messages {
            let message_id = message.id();
            let outcome = self.pipeline.process(message, &context).await;
            context.release_backpressure();
            if let Err(failure) = outcome {
                tracing::error!(
                    message_id = %message_id,
                    error = %failure.error(),
                    "error processing message"
                );
            }
        }
    }
}

/// Runs a single batch pipeline invocation for the whole poll batch.
pub struct BatchMessageSink<T> {
    pipeline: Arc<MessageProcessingPipeline<T>>,
}

impl<T> BatchMessageSink<T> {
    /// Creates a sink over the given pipeline.
    pub fn new(pipeline: Arc<MessageProcessingPipeline<T>>) -> Self {
        Self { pipeline }
    }
}

impl<T> fmt::Debug for BatchMessageSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchMessageSink").finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageSink<T> for BatchMessageSink<T> {
    async fn emit(&self, messages: Vec<Message<T>>, context: ProcessingContext<T>) {
        let count = messages.len();
        let outcome = self.pipeline.process_batch(messages, &context).await;
        for _ in 0..count {
            context.release_backpressure();
        }
        if let Err(failure) = outcome {
            tracing::error!(
                messages = ?failure.message_ids(),
                error = %failure.error(),
                "error processing message batch"
            );
        }
    }
}

/// Splits each batch by group key and delegates one sub-batch per group to
/// the wrapped sink; groups proceed concurrently.
///
/// Wrapping an [`OrderedMessageSink`] yields FIFO-style processing: strict
/// order within a group, parallelism across groups.
pub struct GroupingSinkAdapter<T> {
    delegate: Arc<dyn MessageSink<T>>,
}

impl<T> GroupingSinkAdapter<T> {
    /// Wraps the given sink.
    pub fn new(delegate: Arc<dyn MessageSink<T>>) -> Self {
        Self { delegate }
    }
}

impl<T> fmt::Debug for GroupingSinkAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupingSinkAdapter").finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageSink<T> for GroupingSinkAdapter<T> {
    async fn emit(&self, messages: Vec<Message<T>>, context: ProcessingContext<T>) {
        let mut order: Vec<Option<GroupKey>> = Vec::new();
        let mut groups: Vec<(Option<GroupKey>, Vec<Message<T>>)> = Vec::new();
        for message in messages {
            let key = message.group().cloned();
            if let Some(position) = order.iter().position(|k| *k == key) {
                groups[position].1.push(message);
            } else {
                order.push(key.clone());
                groups.push((key, vec![message]));
            }
        }
        let emissions = groups.into_iter().map(|(_, batch)| {
            let delegate = self.delegate.clone();
            let context = context.clone();
            async move { delegate.emit(batch, context).await }
        });
        futures::future::join_all(emissions).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::acknowledgement::AcknowledgementCallback;
    use crate::error::AcknowledgementError;
    use crate::listener::listener_fn;
    use crate::pipeline::PipelineConfiguration;

    struct NoopCallback;

    #[async_trait]
    impl AcknowledgementCallback<u32> for NoopCallback {
        async fn on_acknowledge(
            &self,
            _messages: Vec<Message<u32>>,
        ) -> Result<(), AcknowledgementError> {
            Ok(())
        }
    }

    fn pipeline(
        seen: Arc<Mutex<Vec<u32>>>,
    ) -> Arc<MessageProcessingPipeline<u32>> {
        let configuration = PipelineConfiguration::builder()
            .listener(Arc::new(listener_fn(move |message: Message<u32>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(*message.payload());
                    Ok(())
                }
            })))
            .build()
            .unwrap();
        Arc::new(MessageProcessingPipeline::from_configuration(configuration))
    }

    fn context() -> ProcessingContext<u32> {
        ProcessingContext::new(Arc::new(NoopCallback))
    }

    #[tokio::test]
    async fn fan_out_processes_every_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = FanOutMessageSink::new(pipeline(seen.clone()));

        let messages = (0..5).map(|i| Message::new(i, format!("r-{i}"))).collect();
        sink.emit(messages, context()).await;

        let mut processed = seen.lock().unwrap().clone();
        processed.sort_unstable();
        assert_eq!(processed, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn ordered_sink_preserves_poll_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = OrderedMessageSink::new(pipeline(seen.clone()));

        let messages = (0..5).map(|i| Message::new(i, format!("r-{i}"))).collect();
        sink.emit(messages, context()).await;

        assert_eq!(seen.lock().unwrap().clone(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn grouping_adapter_keeps_group_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = GroupingSinkAdapter::new(Arc::new(OrderedMessageSink::new(pipeline(
            seen.clone(),
        ))));

        let messages = vec![
            Message::new(1, "r-1").with_group("a"),
            Message::new(2, "r-2").with_group("b"),
            Message::new(3, "r-3").with_group("a"),
            Message::new(4, "r-4").with_group("b"),
        ];
        sink.emit(messages, context()).await;

        let processed = seen.lock().unwrap().clone();
        let group_a: Vec<u32> = processed.iter().copied().filter(|n| n % 2 == 1).collect();
        let group_b: Vec<u32> = processed.iter().copied().filter(|n| n % 2 == 0).collect();
        assert_eq!(group_a, vec![1, 3]);
        assert_eq!(group_b, vec![2, 4]);
    }
}
