//! Acknowledgement processor forwarding every request as it arrives.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AckDispatcher, AcknowledgementCallback, AcknowledgementExecutor, AcknowledgementProcessor,
    AcknowledgementResultCallback,
};
use crate::config::ConsumerOptions;
use crate::error::AcknowledgementError;
use crate::message::{Message, QueueIdentity};

/// Forwards each acknowledgement straight to the executor.
///
/// The configured ordering discipline still applies, and the caller's future
/// resolves with the executor outcome: under [`Parallel`] and immediate
/// scheduling, the pipeline's acknowledgement stage observes broker failures
/// directly.
///
/// [`Parallel`]: super::AcknowledgementOrdering::Parallel
pub struct ImmediateAcknowledgementProcessor<T> {
    dispatcher: AckDispatcher<T>,
    queue: QueueIdentity,
    running: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> ImmediateAcknowledgementProcessor<T> {
    /// Creates a processor for the given executor and options.
    pub fn new(
        executor: Arc<dyn AcknowledgementExecutor<T>>,
        queue: QueueIdentity,
        options: &ConsumerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback<T>>>,
    ) -> Self {
        Self {
            dispatcher: AckDispatcher::new(
                executor,
                options.acknowledgement_ordering,
                options.max_acknowledgements_per_batch,
                queue.clone(),
                result_callback,
            ),
            queue,
            running: AtomicBool::new(false),
        }
    }
}

impl<T> fmt::Debug for ImmediateAcknowledgementProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmediateAcknowledgementProcessor")
            .field("queue", &self.queue)
            .field("running", &self.running)
            .finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementProcessor<T>
    for ImmediateAcknowledgementProcessor<T>
{
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(queue = %self.queue, "immediate acknowledgement processor started");
    }

    async fn stop(&self, _timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(queue = %self.queue, "immediate acknowledgement processor stopped");
        true
    }

    fn callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback<T>> {
        self
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementCallback<T>
    for ImmediateAcknowledgementProcessor<T>
{
    async fn on_acknowledge(&self, messages: Vec<Message<T>>) -> Result<(), AcknowledgementError> {
        if !self.running.load(Ordering::SeqCst) {
            tracing::debug!(queue = %self.queue, "processor not running, skipping acknowledgement");
            return Ok(());
        }
        self.dispatcher.dispatch(messages).await
    }
}
