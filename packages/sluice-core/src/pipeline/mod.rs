//! The composable message-processing pipeline.
//!
//! A pipeline is an explicit ordered list of stages folded over each
//! invocation's input. Every stage receives the *settled* upstream outcome
//! (success with the message(s), or a [`PipelineFailure`] carrying both the
//! error and the messages) and returns its own. This is how nested
//! future-of-future composition renders in async Rust: stages that need to
//! observe failures (error handler, acknowledgement, after-interceptors)
//! simply match on the outcome instead of being skipped by short-circuiting.

use std::fmt;

use async_trait::async_trait;

use crate::error::Error;
use crate::message::{Message, MessageId};

mod config;
mod context;
mod stages;

pub use config::{PipelineConfiguration, PipelineConfigurationBuilder};
pub use context::ProcessingContext;

/// Outcome of a single-message stage.
pub type StageOutcome<T> = Result<Message<T>, PipelineFailure<T>>;

/// Outcome of a batch stage.
pub type BatchStageOutcome<T> = Result<Vec<Message<T>>, PipelineFailure<T>>;

/// A failed pipeline invocation: the error plus the messages it failed.
///
/// Carrying the messages lets downstream stages (error handler,
/// acknowledgement) always extract what failed without re-deriving it.
pub struct PipelineFailure<T> {
    error: Error,
    messages: Vec<Message<T>>,
}

impl<T> PipelineFailure<T> {
    /// Creates a failure for the given messages.
    pub fn new(error: Error, messages: Vec<Message<T>>) -> Self {
        Self { error, messages }
    }

    /// The error that failed the invocation.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The messages that failed.
    pub fn messages(&self) -> &[Message<T>] {
        &self.messages
    }

    /// Ids of the failed messages.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(Message::id).collect()
    }

    /// Decomposes the failure.
    pub fn into_parts(self) -> (Error, Vec<Message<T>>) {
        (self.error, self.messages)
    }
}

impl<T> fmt::Debug for PipelineFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineFailure")
            .field("error", &self.error)
            .field("messages", &self.message_ids())
            .finish()
    }
}

impl<T> fmt::Display for PipelineFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} message(s))", self.error, self.messages.len())
    }
}

impl<T> std::error::Error for PipelineFailure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A single composable unit of message processing.
///
/// Stages must implement single-message processing; batch processing defaults
/// to an explicit "batch unsupported" failure rather than silently degrading.
#[async_trait]
pub trait PipelineStage<T: Send + Sync + 'static>: Send + Sync {
    /// Stage name, used in errors and logs.
    fn name(&self) -> &'static str;

    /// Processes a single message outcome.
    async fn process(&self, input: StageOutcome<T>, context: &ProcessingContext<T>)
        -> StageOutcome<T>;

    /// Processes a batch outcome.
    async fn process_batch(
        &self,
        input: BatchStageOutcome<T>,
        context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        let _ = context;
        match input {
            Ok(messages) => Err(PipelineFailure::new(
                Error::BatchUnsupported { stage: self.name() },
                messages,
            )),
            Err(failure) => Err(failure),
        }
    }
}

/// An ordered chain of stages threading a message (or batch) through
/// interceptors, listener invocation, error handling and acknowledgement.
pub struct MessageProcessingPipeline<T> {
    stages: Vec<Box<dyn PipelineStage<T>>>,
}

impl<T: Send + Sync + 'static> fmt::Debug for MessageProcessingPipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("MessageProcessingPipeline")
            .field("stages", &names)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> MessageProcessingPipeline<T> {
    /// Builds the canonical pipeline for the given configuration:
    /// context-scoped before-interceptors, configured before-interceptors,
    /// listener, error handler, acknowledgement, configured
    /// after-interceptors, context-scoped after-interceptors.
    pub fn from_configuration(configuration: PipelineConfiguration<T>) -> Self {
        let stages: Vec<Box<dyn PipelineStage<T>>> = vec![
            Box::new(stages::BeforeInterceptorStage::from_context()),
            Box::new(stages::BeforeInterceptorStage::configured(
                configuration.interceptors().to_vec(),
            )),
            Box::new(stages::ListenerStage::new(configuration.listener())),
            Box::new(stages::ErrorHandlerStage::new(configuration.error_handler())),
            Box::new(stages::AcknowledgementStage::new(
                configuration.acknowledgement_handler(),
            )),
            Box::new(stages::AfterInterceptorStage::configured(
                configuration.interceptors().to_vec(),
            )),
            Box::new(stages::AfterInterceptorStage::from_context()),
        ];
        Self { stages }
    }

    /// Builds a pipeline from an explicit stage list. Mostly useful in tests
    /// and for custom assemblies.
    pub fn from_stages(stages: Vec<Box<dyn PipelineStage<T>>>) -> Self {
        Self { stages }
    }

    /// Runs a single message through every stage in order.
    pub async fn process(
        &self,
        message: Message<T>,
        context: &ProcessingContext<T>,
    ) -> StageOutcome<T> {
        let mut outcome: StageOutcome<T> = Ok(message);
        for stage in &self.stages {
            outcome = stage.process(outcome, context).await;
        }
        outcome
    }

    /// Runs a poll batch through every stage in order.
    pub async fn process_batch(
        &self,
        messages: Vec<Message<T>>,
        context: &ProcessingContext<T>,
    ) -> BatchStageOutcome<T> {
        let mut outcome: BatchStageOutcome<T> = Ok(messages);
        for stage in &self.stages {
            outcome = stage.process_batch(outcome, context).await;
        }
        outcome
    }
}
