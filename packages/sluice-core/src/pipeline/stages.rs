//! The canonical pipeline stages.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use super::{BatchStageOutcome, PipelineFailure, PipelineStage, ProcessingContext, StageOutcome};
use crate::acknowledgement::AcknowledgementHandler;
use crate::error::Error;
use crate::listener::{ErrorHandler, MessageInterceptor, MessageListener};

enum InterceptorSet<T> {
    Configured(Vec<Arc<dyn MessageInterceptor<T>>>),
    FromContext,
}

impl<T: Send + Sync + 'static> InterceptorSet<T> {
    fn resolve<'a>(
        &'a self,
        context: &'a ProcessingContext<T>,
    ) -> &'a [Arc<dyn MessageInterceptor<T>>] {
        match self {
            Self::Configured(interceptors) => interceptors,
            Self::FromContext => context.interceptors(),
        }
    }
}

/// Runs before-interceptors; each may transform or veto the message.
pub(crate) struct BeforeInterceptorStage<T> {
    set: InterceptorSet<T>,
    name: &'static str,
}

impl<T> BeforeInterceptorStage<T> {
    pub(crate) fn configured(interceptors: Vec<Arc<dyn MessageInterceptor<T>>>) -> Self {
        Self {
            set: InterceptorSet::Configured(interceptors),
            name: "before-interceptors",
        }
    }

    pub(crate) fn from_context() -> Self {
        Self {
            set: InterceptorSet::FromContext,
            name: "context-before-interceptors",
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PipelineStage<T> for BeforeInterceptorStage<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(
        &self,
        input: StageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        let mut message = input?;
        for interceptor in self.set.resolve(context) {
            let checkpoint = message.clone();
            match interceptor.intercept(message).await {
                Ok(next) => message = next,
                Err(source) => {
                    return Err(PipelineFailure::new(
                        Error::Interceptor { source },
                        vec![checkpoint],
                    ))
                }
            }
        }
        Ok(message)
    }

    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        let mut messages = input?;
        for interceptor in self.set.resolve(context) {
            let checkpoint = messages.clone();
            match interceptor.intercept_batch(messages).await {
                Ok(next) if next.is_empty() => {
                    return Err(PipelineFailure::new(Error::EmptyInterceptorResult, checkpoint))
                }
                Ok(next) => messages = next,
                Err(source) => {
                    return Err(PipelineFailure::new(
                        Error::Interceptor { source },
                        checkpoint,
                    ))
                }
            }
        }
        Ok(messages)
    }
}

/// Invokes the application listener, turning errors and panics into a
/// listener failure carrying the message(s).
pub(crate) struct ListenerStage<T> {
    listener: Arc<dyn MessageListener<T>>,
}

impl<T> ListenerStage<T> {
    pub(crate) fn new(listener: Arc<dyn MessageListener<T>>) -> Self {
        Self { listener }
    }
}

fn panic_description(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {text}")
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("listener panicked: {text}")
    } else {
        "listener panicked".to_owned()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PipelineStage<T> for ListenerStage<T> {
    fn name(&self) -> &'static str {
        "listener"
    }

    async fn process(
        &self,
        input: StageOutcome<T>,
        _context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        let message = input?;
        let checkpoint = message.clone();
        match AssertUnwindSafe(self.listener.on_message(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(checkpoint),
            Ok(Err(source)) => Err(PipelineFailure::new(
                Error::Listener { source },
                vec![checkpoint],
            )),
            Err(panic) => Err(PipelineFailure::new(
                Error::Listener {
                    source: panic_description(panic).into(),
                },
                vec![checkpoint],
            )),
        }
    }

    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        _context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        let messages = input?;
        let checkpoint = messages.clone();
        match AssertUnwindSafe(self.listener.on_batch(messages))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(checkpoint),
            Ok(Err(source)) => Err(PipelineFailure::new(Error::Listener { source }, checkpoint)),
            Err(panic) => Err(PipelineFailure::new(
                Error::Listener {
                    source: panic_description(panic).into(),
                },
                checkpoint,
            )),
        }
    }
}

/// Invokes the error handler for side effects on failure, then re-raises the
/// original error. Never suppresses the failure.
pub(crate) struct ErrorHandlerStage<T> {
    error_handler: Arc<dyn ErrorHandler<T>>,
}

impl<T> ErrorHandlerStage<T> {
    pub(crate) fn new(error_handler: Arc<dyn ErrorHandler<T>>) -> Self {
        Self { error_handler }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PipelineStage<T> for ErrorHandlerStage<T> {
    fn name(&self) -> &'static str {
        "error-handler"
    }

    async fn process(
        &self,
        input: StageOutcome<T>,
        _context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        match input {
            Ok(message) => Ok(message),
            Err(failure) => {
                if let Err(handler_error) = self
                    .error_handler
                    .on_error(failure.messages(), failure.error())
                    .await
                {
                    tracing::error!(error = %handler_error, "error handler failed");
                }
                Err(failure)
            }
        }
    }

    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        _context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        match input {
            Ok(messages) => Ok(messages),
            Err(failure) => {
                if let Err(handler_error) = self
                    .error_handler
                    .on_error(failure.messages(), failure.error())
                    .await
                {
                    tracing::error!(error = %handler_error, "error handler failed");
                }
                Err(failure)
            }
        }
    }
}

/// Triggers the acknowledgement handler exactly once per message per
/// invocation: the success path on success, the error path on failure.
pub(crate) struct AcknowledgementStage<T> {
    handler: Arc<dyn AcknowledgementHandler<T>>,
}

impl<T> AcknowledgementStage<T> {
    pub(crate) fn new(handler: Arc<dyn AcknowledgementHandler<T>>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PipelineStage<T> for AcknowledgementStage<T> {
    fn name(&self) -> &'static str {
        "acknowledgement"
    }

    async fn process(
        &self,
        input: StageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        match input {
            Ok(message) => {
                let result = self
                    .handler
                    .on_success(
                        std::slice::from_ref(&message),
                        context.acknowledgement_callback(),
                    )
                    .await;
                match result {
                    Ok(()) => Ok(message),
                    Err(error) => Err(PipelineFailure::new(
                        Error::Acknowledgement(error),
                        vec![message],
                    )),
                }
            }
            Err(failure) => {
                if let Err(error) = self
                    .handler
                    .on_error(
                        failure.messages(),
                        failure.error(),
                        context.acknowledgement_callback(),
                    )
                    .await
                {
                    tracing::error!(%error, "acknowledging failed message(s) did not complete");
                }
                Err(failure)
            }
        }
    }

    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        match input {
            Ok(messages) => {
                let result = self
                    .handler
                    .on_success(&messages, context.acknowledgement_callback())
                    .await;
                match result {
                    Ok(()) => Ok(messages),
                    Err(error) => {
                        Err(PipelineFailure::new(Error::Acknowledgement(error), messages))
                    }
                }
            }
            Err(failure) => {
                if let Err(error) = self
                    .handler
                    .on_error(
                        failure.messages(),
                        failure.error(),
                        context.acknowledgement_callback(),
                    )
                    .await
                {
                    tracing::error!(%error, "acknowledging failed message(s) did not complete");
                }
                Err(failure)
            }
        }
    }
}

/// Runs after-interceptors unconditionally; their failures are logged, never
/// propagated, so they cannot mask the processing outcome.
pub(crate) struct AfterInterceptorStage<T> {
    set: InterceptorSet<T>,
    name: &'static str,
}

impl<T> AfterInterceptorStage<T> {
    pub(crate) fn configured(interceptors: Vec<Arc<dyn MessageInterceptor<T>>>) -> Self {
        Self {
            set: InterceptorSet::Configured(interceptors),
            name: "after-interceptors",
        }
    }

    pub(crate) fn from_context() -> Self {
        Self {
            set: InterceptorSet::FromContext,
            name: "context-after-interceptors",
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> PipelineStage<T> for AfterInterceptorStage<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(
        &self,
        input: StageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        {
            let (messages, error) = match &input {
                Ok(message) => (std::slice::from_ref(message), None),
                Err(failure) => (failure.messages(), Some(failure.error())),
            };
            for interceptor in self.set.resolve(context) {
                if let Err(after_error) = interceptor.after_process(messages, error).await {
                    tracing::error!(error = %after_error, "after-processing interceptor failed");
                }
            }
        }
        input
    }

    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        {
            let (messages, error) = match &input {
                Ok(messages) => (messages.as_slice(), None),
                Err(failure) => (failure.messages(), Some(failure.error())),
            };
            for interceptor in self.set.resolve(context) {
                if let Err(after_error) = interceptor.after_process(messages, error).await {
                    tracing::error!(error = %after_error, "after-processing interceptor failed");
                }
            }
        }
        input
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::acknowledgement::{AcknowledgementCallback, OnSuccessAcknowledgementHandler};
    use crate::error::{AcknowledgementError, BoxError};
    use crate::listener::listener_fn;
    use crate::message::{Message, MessageId, QueueIdentity};
    use crate::pipeline::{MessageProcessingPipeline, PipelineConfiguration};

    struct RecordingCallback {
        acknowledged: Mutex<Vec<Vec<MessageId>>>,
        fail: bool,
    }

    impl RecordingCallback {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                acknowledged: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn calls(&self) -> Vec<Vec<MessageId>> {
            self.acknowledged.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AcknowledgementCallback<u32> for RecordingCallback {
        async fn on_acknowledge(
            &self,
            messages: Vec<Message<u32>>,
        ) -> Result<(), AcknowledgementError> {
            self.acknowledged
                .lock()
                .unwrap()
                .push(messages.iter().map(Message::id).collect());
            if self.fail {
                return Err(AcknowledgementError::new(
                    QueueIdentity::new("orders", "url"),
                    Vec::new(),
                    "broker unavailable",
                ));
            }
            Ok(())
        }
    }

    struct RecordingErrorHandler {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ErrorHandler<u32> for RecordingErrorHandler {
        async fn on_error(&self, _messages: &[Message<u32>], _error: &Error) -> Result<(), BoxError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TaggingInterceptor;

    #[async_trait]
    impl MessageInterceptor<u32> for TaggingInterceptor {
        async fn intercept(&self, message: Message<u32>) -> Result<Message<u32>, BoxError> {
            Ok(message.map(|n| n + 1))
        }
    }

    struct CountingAfterInterceptor {
        after: AtomicUsize,
        saw_error: AtomicUsize,
    }

    #[async_trait]
    impl MessageInterceptor<u32> for CountingAfterInterceptor {
        async fn after_process(
            &self,
            _messages: &[Message<u32>],
            error: Option<&Error>,
        ) -> Result<(), BoxError> {
            self.after.fetch_add(1, Ordering::SeqCst);
            if error.is_some() {
                self.saw_error.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn pipeline_with(
        listener: Arc<dyn MessageListener<u32>>,
        interceptors: Vec<Arc<dyn MessageInterceptor<u32>>>,
        error_handler: Arc<dyn ErrorHandler<u32>>,
    ) -> MessageProcessingPipeline<u32> {
        let configuration = PipelineConfiguration::builder()
            .listener(listener)
            .interceptors(interceptors)
            .error_handler(error_handler)
            .acknowledgement_handler(Arc::new(OnSuccessAcknowledgementHandler))
            .build()
            .unwrap();
        MessageProcessingPipeline::from_configuration(configuration)
    }

    #[tokio::test]
    async fn success_acknowledges_exactly_once() {
        let callback = RecordingCallback::new(false);
        let context = ProcessingContext::new(callback.clone());
        let pipeline = pipeline_with(
            Arc::new(listener_fn(|_message: Message<u32>| async { Ok(()) })),
            Vec::new(),
            Arc::new(LoggingErrorHandlerProbe::default()),
        );
        let message = Message::new(1, "r-1");
        let id = message.id();

        let outcome = pipeline.process(message, &context).await;

        assert!(outcome.is_ok());
        assert_eq!(callback.calls(), vec![vec![id]]);
    }

    #[tokio::test]
    async fn listener_failure_runs_error_handler_and_reraises() {
        let callback = RecordingCallback::new(false);
        let context = ProcessingContext::new(callback.clone());
        let error_handler = Arc::new(RecordingErrorHandler {
            seen: AtomicUsize::new(0),
        });
        let pipeline = pipeline_with(
            Arc::new(listener_fn(|_message: Message<u32>| async {
                Err::<(), BoxError>("boom".into())
            })),
            Vec::new(),
            error_handler.clone(),
        );

        let outcome = pipeline.process(Message::new(1, "r-1"), &context).await;

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error(), Error::Listener { .. }));
        assert_eq!(error_handler.seen.load(Ordering::SeqCst), 1);
        // On-success acknowledgement mode: a failed message is not acked.
        assert!(callback.calls().is_empty());
    }

    #[tokio::test]
    async fn listener_panic_is_contained() {
        let callback = RecordingCallback::new(false);
        let context = ProcessingContext::new(callback.clone());
        let pipeline = pipeline_with(
            Arc::new(listener_fn(|message: Message<u32>| async move {
                if *message.payload() == 1 {
                    panic!("unexpected payload");
                }
                Ok(())
            })),
            Vec::new(),
            Arc::new(LoggingErrorHandlerProbe::default()),
        );

        let outcome = pipeline.process(Message::new(1, "r-1"), &context).await;

        let failure = outcome.unwrap_err();
        match failure.error() {
            Error::Listener { source } => {
                assert!(source.to_string().contains("panicked"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn interceptors_transform_before_the_listener() {
        let callback = RecordingCallback::new(false);
        let context = ProcessingContext::new(callback.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener_seen = seen.clone();
        let pipeline = pipeline_with(
            Arc::new(listener_fn(move |message: Message<u32>| {
                let seen = listener_seen.clone();
                async move {
                    seen.lock().unwrap().push(*message.payload());
                    Ok(())
                }
            })),
            vec![Arc::new(TaggingInterceptor), Arc::new(TaggingInterceptor)],
            Arc::new(LoggingErrorHandlerProbe::default()),
        );

        pipeline
            .process(Message::new(40, "r-1"), &context)
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().clone(), vec![42]);
    }

    #[tokio::test]
    async fn after_interceptors_observe_failures_without_masking_them() {
        let callback = RecordingCallback::new(false);
        let after = Arc::new(CountingAfterInterceptor {
            after: AtomicUsize::new(0),
            saw_error: AtomicUsize::new(0),
        });
        let context = ProcessingContext::new(callback.clone());
        let pipeline = pipeline_with(
            Arc::new(listener_fn(|_message: Message<u32>| async {
                Err::<(), BoxError>("boom".into())
            })),
            vec![after.clone()],
            Arc::new(LoggingErrorHandlerProbe::default()),
        );

        let outcome = pipeline.process(Message::new(1, "r-1"), &context).await;

        assert!(outcome.is_err());
        assert_eq!(after.after.load(Ordering::SeqCst), 1);
        assert_eq!(after.saw_error.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acknowledgement_failure_becomes_the_outcome() {
        let callback = RecordingCallback::new(true);
        let context = ProcessingContext::new(callback.clone());
        let pipeline = pipeline_with(
            Arc::new(listener_fn(|_message: Message<u32>| async { Ok(()) })),
            Vec::new(),
            Arc::new(LoggingErrorHandlerProbe::default()),
        );

        let outcome = pipeline.process(Message::new(1, "r-1"), &context).await;

        let failure = outcome.unwrap_err();
        assert!(matches!(failure.error(), Error::Acknowledgement(_)));
        assert_eq!(callback.calls().len(), 1);
    }

    #[tokio::test]
    async fn batch_pipeline_acknowledges_the_whole_batch_once() {
        let callback = RecordingCallback::new(false);
        let context = ProcessingContext::new(callback.clone());
        let pipeline = pipeline_with(
            Arc::new(crate::listener::batch_listener_fn(
                |_messages: Vec<Message<u32>>| async { Ok(()) },
            )),
            Vec::new(),
            Arc::new(LoggingErrorHandlerProbe::default()),
        );
        let messages = vec![Message::new(1, "r-1"), Message::new(2, "r-2")];
        let ids: Vec<MessageId> = messages.iter().map(Message::id).collect();

        pipeline.process_batch(messages, &context).await.unwrap();

        assert_eq!(callback.calls(), vec![ids]);
    }

    #[derive(Default)]
    struct LoggingErrorHandlerProbe;

    #[async_trait]
    impl ErrorHandler<u32> for LoggingErrorHandlerProbe {
        async fn on_error(&self, _messages: &[Message<u32>], _error: &Error) -> Result<(), BoxError> {
            Ok(())
        }
    }
}
