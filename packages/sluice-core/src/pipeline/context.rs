//! Per-invocation processing context.

use std::fmt;
use std::sync::Arc;

use crate::acknowledgement::AcknowledgementCallback;
use crate::listener::MessageInterceptor;

/// Context shared by all stages processing one poll batch.
///
/// Created once per batch by the polling source and discarded when the
/// pipeline completes. Carries the context-scoped interceptors, the
/// acknowledgement callback for the batch, and the callback releasing one
/// backpressure permit per finished message.
pub struct ProcessingContext<T> {
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    ack_callback: Arc<dyn AcknowledgementCallback<T>>,
    backpressure_release: Arc<dyn Fn() + Send + Sync>,
}

impl<T> Clone for ProcessingContext<T> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
            ack_callback: self.ack_callback.clone(),
            backpressure_release: self.backpressure_release.clone(),
        }
    }
}

impl<T> fmt::Debug for ProcessingContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> ProcessingContext<T> {
    /// Creates a context with no interceptors and a no-op backpressure
    /// release.
    pub fn new(ack_callback: Arc<dyn AcknowledgementCallback<T>>) -> Self {
        Self {
            interceptors: Vec::new(),
            ack_callback,
            backpressure_release: Arc::new(|| {}),
        }
    }

    /// Sets the context-scoped interceptors.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn MessageInterceptor<T>>>) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Sets the callback releasing one permit per finished message.
    pub fn with_backpressure_release(mut self, release: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.backpressure_release = release;
        self
    }

    /// Releases one backpressure permit.
    pub fn release_backpressure(&self) {
        (self.backpressure_release)();
    }

    /// The acknowledgement callback for this batch.
    pub fn acknowledgement_callback(&self) -> &dyn AcknowledgementCallback<T> {
        self.ack_callback.as_ref()
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn MessageInterceptor<T>>] {
        &self.interceptors
    }
}
