//! Mode-driven acknowledgement handlers used by the pipeline's
//! acknowledgement stage.

use std::sync::Arc;

use async_trait::async_trait;

use super::{AcknowledgementCallback, AcknowledgementMode};
use crate::error::{AcknowledgementError, Error};
use crate::message::Message;

/// Decides whether a processing outcome triggers the acknowledgement
/// callback.
///
/// The pipeline invokes exactly one of the two paths per message per
/// invocation: `on_success` when processing succeeded, `on_error` when it
/// failed.
#[async_trait]
pub trait AcknowledgementHandler<T: Send + Sync + 'static>: Send + Sync {
    /// Called when processing succeeded.
    async fn on_success(
        &self,
        messages: &[Message<T>],
        callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError>;

    /// Called when processing failed with `error`.
    async fn on_error(
        &self,
        messages: &[Message<T>],
        error: &Error,
        callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError>;
}

/// Acknowledges only successfully processed messages; failed messages are
/// left for the broker to redeliver.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnSuccessAcknowledgementHandler;

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementHandler<T>
    for OnSuccessAcknowledgementHandler
{
    async fn on_success(
        &self,
        messages: &[Message<T>],
        callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        callback.on_acknowledge(messages.to_vec()).await
    }

    async fn on_error(
        &self,
        _messages: &[Message<T>],
        _error: &Error,
        _callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        Ok(())
    }
}

/// Acknowledges messages regardless of the processing outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAcknowledgementHandler;

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementHandler<T> for AlwaysAcknowledgementHandler {
    async fn on_success(
        &self,
        messages: &[Message<T>],
        callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        callback.on_acknowledge(messages.to_vec()).await
    }

    async fn on_error(
        &self,
        messages: &[Message<T>],
        _error: &Error,
        callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        callback.on_acknowledge(messages.to_vec()).await
    }
}

/// Never acknowledges; the application manages acknowledgement itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAcknowledgementHandler;

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementHandler<T> for NeverAcknowledgementHandler {
    async fn on_success(
        &self,
        _messages: &[Message<T>],
        _callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        Ok(())
    }

    async fn on_error(
        &self,
        _messages: &[Message<T>],
        _error: &Error,
        _callback: &dyn AcknowledgementCallback<T>,
    ) -> Result<(), AcknowledgementError> {
        Ok(())
    }
}

/// The handler implementing the given mode.
pub fn handler_for<T: Clone + Send + Sync + 'static>(
    mode: AcknowledgementMode,
) -> Arc<dyn AcknowledgementHandler<T>> {
    match mode {
        AcknowledgementMode::OnSuccess => Arc::new(OnSuccessAcknowledgementHandler),
        AcknowledgementMode::Always => Arc::new(AlwaysAcknowledgementHandler),
        AcknowledgementMode::Manual => Arc::new(NeverAcknowledgementHandler),
    }
}
