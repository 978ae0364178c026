//! Explicit consumer assembly.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use sluice_core::acknowledgement::{
    handler_for, AcknowledgementClient, AcknowledgementOrdering, AcknowledgementProcessor,
    AcknowledgementResultCallback, BatchingAcknowledgementProcessor,
    ClientAcknowledgementExecutor, ImmediateAcknowledgementProcessor,
};
use sluice_core::backpressure::standard_handler;
use sluice_core::config::{ConsumerOptions, ListenerMode};
use sluice_core::error::{BoxError, Error};
use sluice_core::listener::{listener_fn, ErrorHandler, MessageInterceptor, MessageListener};
use sluice_core::message::{Message, MessageConverter, QueueIdentity};
use sluice_core::pipeline::{MessageProcessingPipeline, PipelineConfiguration};
use sluice_core::sink::{
    BatchMessageSink, FanOutMessageSink, GroupingSinkAdapter, MessageSink, OrderedMessageSink,
};
use sluice_core::source::{MessagePoller, PollingMessageSource, SourceState};

/// Builds a [`MessageConsumer`] by registering collaborators as plain values.
///
/// Everything is resolved when [`build`](Self::build) runs; nothing is
/// discovered at runtime.
pub struct MessageConsumerBuilder<T> {
    queue: QueueIdentity,
    options: ConsumerOptions,
    listener: Option<Arc<dyn MessageListener<T>>>,
    converter: Option<Arc<dyn MessageConverter<T>>>,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
    result_callback: Option<Arc<dyn AcknowledgementResultCallback<T>>>,
}

impl<T> fmt::Debug for MessageConsumerBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumerBuilder")
            .field("queue", &self.queue)
            .field("listener", &self.listener.is_some())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> MessageConsumerBuilder<T> {
    /// Starts building a consumer for the given queue.
    pub fn new(queue: QueueIdentity) -> Self {
        Self {
            queue,
            options: ConsumerOptions::default(),
            listener: None,
            converter: None,
            interceptors: Vec::new(),
            error_handler: None,
            result_callback: None,
        }
    }

    /// Sets the consumer options.
    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers the application listener. Required.
    pub fn listener(mut self, listener: impl MessageListener<T> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Registers an async closure as the listener.
    pub fn listener_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.listener(listener_fn(f))
    }

    /// Registers the wire-message converter. Required.
    pub fn converter(mut self, converter: impl MessageConverter<T> + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Appends an interceptor running around every listener invocation.
    pub fn interceptor(mut self, interceptor: impl MessageInterceptor<T> + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Registers the error handler.
    pub fn error_handler(mut self, error_handler: impl ErrorHandler<T> + 'static) -> Self {
        self.error_handler = Some(Arc::new(error_handler));
        self
    }

    /// Registers a callback observing acknowledgement results.
    pub fn acknowledgement_result_callback(
        mut self,
        callback: impl AcknowledgementResultCallback<T> + 'static,
    ) -> Self {
        self.result_callback = Some(Arc::new(callback));
        self
    }

    /// Assembles the consumer around the given broker adapters.
    pub fn build(
        self,
        poller: impl MessagePoller + 'static,
        client: impl AcknowledgementClient + 'static,
    ) -> Result<MessageConsumer<T>, Error> {
        self.options.validate()?;
        let listener = self
            .listener
            .ok_or_else(|| Error::Configuration {
                reason: "consumer requires a listener".to_owned(),
            })?;
        let converter = self.converter.ok_or_else(|| Error::Configuration {
            reason: "consumer requires a converter".to_owned(),
        })?;

        let executor = Arc::new(ClientAcknowledgementExecutor::new(client, self.queue.clone()));
        let immediate = self.options.acknowledgement_interval.is_zero()
            && self.options.acknowledgement_threshold == 0;
        let processor: Arc<dyn AcknowledgementProcessor<T>> = if immediate {
            Arc::new(ImmediateAcknowledgementProcessor::new(
                executor,
                self.queue.clone(),
                &self.options,
                self.result_callback,
            ))
        } else {
            Arc::new(BatchingAcknowledgementProcessor::new(
                executor,
                self.queue.clone(),
                &self.options,
                self.result_callback,
            )?)
        };

        let mut configuration = PipelineConfiguration::builder()
            .listener(listener)
            .interceptors(self.interceptors)
            .acknowledgement_handler(handler_for(self.options.acknowledgement_mode));
        if let Some(error_handler) = self.error_handler {
            configuration = configuration.error_handler(error_handler);
        }
        let pipeline = Arc::new(MessageProcessingPipeline::from_configuration(
            configuration.build()?,
        ));

        let sink: Arc<dyn MessageSink<T>> = match self.options.listener_mode {
            ListenerMode::Batch => Arc::new(BatchMessageSink::new(pipeline)),
            ListenerMode::Single => {
                if self.options.acknowledgement_ordering == AcknowledgementOrdering::OrderedByGroup
                {
                    // Grouped queues: strict order within a group, parallel
                    // across groups.
                    Arc::new(GroupingSinkAdapter::new(Arc::new(OrderedMessageSink::new(
                        pipeline,
                    ))))
                } else {
                    Arc::new(FanOutMessageSink::new(pipeline))
                }
            }
        };

        let source = PollingMessageSource::builder(self.queue)
            .poller(Arc::new(poller))
            .converter(converter)
            .sink(sink)
            .back_pressure(standard_handler(&self.options))
            .acknowledgement_processor(processor)
            .poll_back_off(self.options.poll_back_off.clone())
            .shutdown_timeout(self.options.listener_shutdown_timeout)
            .acknowledgement_shutdown_timeout(self.options.acknowledgement_shutdown_timeout)
            .build()?;

        Ok(MessageConsumer { source })
    }
}

/// A fully wired consumer: a polling source feeding the processing pipeline.
pub struct MessageConsumer<T> {
    source: PollingMessageSource<T>,
}

impl<T> fmt::Debug for MessageConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("source", &self.source)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> MessageConsumer<T> {
    /// Starts consuming. Must be called from within a tokio runtime.
    pub fn start(&self) {
        tracing::debug!("starting consumer");
        self.source.start();
    }

    /// Stops consuming, waiting for in-flight work per the configured
    /// shutdown timeouts.
    pub async fn stop(&self) {
        tracing::debug!("stopping consumer");
        self.source.stop().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.source.state()
    }

    /// Whether the consumer is accepting and processing work.
    pub fn is_running(&self) -> bool {
        self.source.is_running()
    }
}
