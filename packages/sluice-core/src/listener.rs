//! Application-facing seams: the listener invoked per message, interceptors
//! that run around it, and the error handler observing failures.
//!
//! All seams are object-safe async traits so they can be registered as plain
//! values at startup and shared read-only across concurrent pipeline
//! invocations.

use std::future::Future;

use async_trait::async_trait;

use crate::error::{BoxError, Error};
use crate::message::Message;

/// The application-supplied message handler.
///
/// A listener receives an owned copy of each message. Returning an error (or
/// panicking) fails the pipeline invocation: the message is not acknowledged
/// and the broker redelivers it according to its own policy.
#[async_trait]
pub trait MessageListener<T: Send + Sync + 'static>: Send + Sync {
    /// Handles a single message.
    async fn on_message(&self, message: Message<T>) -> Result<(), BoxError>;

    /// Handles a whole poll batch at once.
    ///
    /// The default implementation rejects batch mode explicitly rather than
    /// degrading to per-message delivery.
    async fn on_batch(&self, messages: Vec<Message<T>>) -> Result<(), BoxError> {
        drop(messages);
        Err(Box::new(Error::BatchUnsupported { stage: "listener" }))
    }
}

/// Adapts an async closure into a [`MessageListener`].
#[derive(Debug, Clone)]
pub struct FnListener<F> {
    f: F,
}

/// Wraps an async closure taking a single [`Message`].
///
/// ```
/// use sluice_core::listener::listener_fn;
/// use sluice_core::message::Message;
///
/// let listener = listener_fn(|message: Message<String>| async move {
///     println!("got {}", message.payload());
///     Ok(())
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F>(f: F) -> FnListener<F> {
    FnListener { f }
}

#[async_trait]
impl<T, F, Fut> MessageListener<T> for FnListener<F>
where
    T: Send + Sync + 'static,
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn on_message(&self, message: Message<T>) -> Result<(), BoxError> {
        (self.f)(message).await
    }
}

/// Adapts an async closure into a batch [`MessageListener`].
///
/// Single messages are delivered as one-element batches.
#[derive(Debug, Clone)]
pub struct FnBatchListener<F> {
    f: F,
}

/// Wraps an async closure taking a whole poll batch.
pub fn batch_listener_fn<F>(f: F) -> FnBatchListener<F> {
    FnBatchListener { f }
}

#[async_trait]
impl<T, F, Fut> MessageListener<T> for FnBatchListener<F>
where
    T: Send + Sync + 'static,
    F: Fn(Vec<Message<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    async fn on_message(&self, message: Message<T>) -> Result<(), BoxError> {
        (self.f)(vec![message]).await
    }

    async fn on_batch(&self, messages: Vec<Message<T>>) -> Result<(), BoxError> {
        (self.f)(messages).await
    }
}

/// Intercepts messages before and after listener execution.
///
/// Before-interceptors may transform a message or veto it by returning an
/// error; a veto fails the invocation like a listener error would.
/// After-interception always runs, success or failure, and its own errors are
/// logged rather than propagated.
#[async_trait]
pub trait MessageInterceptor<T: Send + Sync + 'static>: Send + Sync {
    /// Runs before the listener for a single message.
    async fn intercept(&self, message: Message<T>) -> Result<Message<T>, BoxError> {
        Ok(message)
    }

    /// Runs before the listener for a batch. Must not return an empty batch.
    async fn intercept_batch(&self, messages: Vec<Message<T>>) -> Result<Vec<Message<T>>, BoxError> {
        Ok(messages)
    }

    /// Runs after processing completed, with the failure if there was one.
    async fn after_process(
        &self,
        messages: &[Message<T>],
        error: Option<&Error>,
    ) -> Result<(), BoxError> {
        let _ = (messages, error);
        Ok(())
    }
}

/// Observes processing failures for side effects (logging, DLQ routing).
///
/// The handler cannot suppress a failure: the pipeline re-raises the original
/// error once the handler completes.
#[async_trait]
pub trait ErrorHandler<T: Send + Sync + 'static>: Send + Sync {
    /// Called with the failed message(s) and the error that failed them.
    async fn on_error(&self, messages: &[Message<T>], error: &Error) -> Result<(), BoxError>;
}

/// Default error handler: logs and moves on.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

#[async_trait]
impl<T: Send + Sync + 'static> ErrorHandler<T> for LoggingErrorHandler {
    async fn on_error(&self, messages: &[Message<T>], error: &Error) -> Result<(), BoxError> {
        let ids: Vec<String> = messages.iter().map(|m| m.id().to_string()).collect();
        tracing::error!(messages = ?ids, %error, "error processing message(s)");
        Ok(())
    }
}
