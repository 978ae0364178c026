//! Acknowledgement subsystem: deciding when and in what order delivery
//! confirmations are sent to the broker.
//!
//! The pipeline marks messages for acknowledgement through an
//! [`AcknowledgementCallback`] obtained from an [`AcknowledgementProcessor`].
//! Processors decide scheduling (immediately, or buffered by threshold and
//! interval) and ordering discipline, then hand chunks of messages to an
//! [`AcknowledgementExecutor`] wrapping the broker's delete/confirm call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AcknowledgementError;
use crate::message::Message;

mod batching;
mod dispatch;
mod executor;
mod handler;
mod immediate;

pub use batching::BatchingAcknowledgementProcessor;
pub use executor::{AcknowledgementClient, AcknowledgementExecutor, ClientAcknowledgementExecutor};
pub use handler::{
    handler_for, AcknowledgementHandler, AlwaysAcknowledgementHandler,
    NeverAcknowledgementHandler, OnSuccessAcknowledgementHandler,
};
pub use immediate::ImmediateAcknowledgementProcessor;

pub(crate) use dispatch::AckDispatcher;

/// Concurrency discipline for acknowledgement calls.
///
/// Fixed per processor instance at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgementOrdering {
    /// All calls are issued concurrently with no ordering guarantee.
    #[default]
    Parallel,
    /// Call N+1 is not issued until call N's future completes.
    Ordered,
    /// Calls are serialized within the same group key; different groups
    /// proceed concurrently.
    OrderedByGroup,
}

/// When the pipeline's acknowledgement stage triggers the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcknowledgementMode {
    /// Acknowledge only successfully processed messages.
    #[default]
    OnSuccess,
    /// Acknowledge regardless of the processing outcome.
    Always,
    /// Never acknowledge; the application manages acknowledgement itself.
    Manual,
}

/// Marks messages for acknowledgement.
///
/// Obtained from a processor and shared by every pipeline invocation of the
/// same consumer.
#[async_trait]
pub trait AcknowledgementCallback<T: Send + Sync + 'static>: Send + Sync {
    /// Marks the given messages for acknowledgement.
    ///
    /// Whether the returned future reflects the broker call depends on the
    /// processor: immediate processors resolve with the executor outcome,
    /// batching processors resolve once the messages are buffered.
    async fn on_acknowledge(&self, messages: Vec<Message<T>>) -> Result<(), AcknowledgementError>;
}

/// Decides when to invoke the [`AcknowledgementExecutor`] for buffered or
/// incoming acknowledgements, and in what order.
#[async_trait]
pub trait AcknowledgementProcessor<T: Send + Sync + 'static>: Send + Sync {
    /// Starts the processor. Must be called from within a tokio runtime.
    fn start(&self);

    /// Stops the processor, waiting up to `timeout` for in-flight
    /// acknowledgement executions. Returns whether everything finished.
    async fn stop(&self, timeout: Duration) -> bool;

    /// The callback handed to pipeline invocations.
    fn callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback<T>>;
}

/// Observes acknowledgement execution results.
#[async_trait]
pub trait AcknowledgementResultCallback<T: Send + Sync + 'static>: Send + Sync {
    /// Called after the given messages were acknowledged successfully.
    async fn on_success(&self, messages: &[Message<T>]) {
        let _ = messages;
    }

    /// Called after acknowledging the given messages failed.
    async fn on_failure(&self, messages: &[Message<T>], error: &AcknowledgementError) {
        let _ = (messages, error);
    }
}
