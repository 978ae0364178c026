//! Immutable pipeline configuration.

use std::fmt;
use std::sync::Arc;

use crate::acknowledgement::{AcknowledgementHandler, OnSuccessAcknowledgementHandler};
use crate::error::Error;
use crate::listener::{ErrorHandler, LoggingErrorHandler, MessageInterceptor, MessageListener};

/// Bundles the listener, interceptors, error handler and acknowledgement
/// handler of a consumer.
///
/// Built once at startup and shared read-only by every pipeline invocation;
/// nothing here mutates per message.
pub struct PipelineConfiguration<T> {
    listener: Arc<dyn MessageListener<T>>,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Arc<dyn ErrorHandler<T>>,
    acknowledgement_handler: Arc<dyn AcknowledgementHandler<T>>,
}

impl<T> Clone for PipelineConfiguration<T> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            interceptors: self.interceptors.clone(),
            error_handler: self.error_handler.clone(),
            acknowledgement_handler: self.acknowledgement_handler.clone(),
        }
    }
}

impl<T> fmt::Debug for PipelineConfiguration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfiguration")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> PipelineConfiguration<T> {
    /// Starts building a configuration.
    pub fn builder() -> PipelineConfigurationBuilder<T> {
        PipelineConfigurationBuilder::new()
    }

    pub(crate) fn listener(&self) -> Arc<dyn MessageListener<T>> {
        self.listener.clone()
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn MessageInterceptor<T>>] {
        &self.interceptors
    }

    pub(crate) fn error_handler(&self) -> Arc<dyn ErrorHandler<T>> {
        self.error_handler.clone()
    }

    pub(crate) fn acknowledgement_handler(&self) -> Arc<dyn AcknowledgementHandler<T>> {
        self.acknowledgement_handler.clone()
    }
}

/// Builder for [`PipelineConfiguration`].
pub struct PipelineConfigurationBuilder<T> {
    listener: Option<Arc<dyn MessageListener<T>>>,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
    acknowledgement_handler: Option<Arc<dyn AcknowledgementHandler<T>>>,
}

impl<T> fmt::Debug for PipelineConfigurationBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfigurationBuilder")
            .field("listener", &self.listener.is_some())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> PipelineConfigurationBuilder<T> {
    fn new() -> Self {
        Self {
            listener: None,
            interceptors: Vec::new(),
            error_handler: None,
            acknowledgement_handler: None,
        }
    }

    /// Sets the application listener. Required.
    pub fn listener(mut self, listener: Arc<dyn MessageListener<T>>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Appends a configured interceptor.
    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor<T>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Appends several configured interceptors.
    pub fn interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn MessageInterceptor<T>>>,
    ) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Sets the error handler. Defaults to [`LoggingErrorHandler`].
    pub fn error_handler(mut self, error_handler: Arc<dyn ErrorHandler<T>>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    /// Sets the acknowledgement handler. Defaults to
    /// [`OnSuccessAcknowledgementHandler`].
    pub fn acknowledgement_handler(
        mut self,
        acknowledgement_handler: Arc<dyn AcknowledgementHandler<T>>,
    ) -> Self {
        self.acknowledgement_handler = Some(acknowledgement_handler);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<PipelineConfiguration<T>, Error> {
        let listener = self
            .listener
            .ok_or_else(|| Error::configuration("pipeline configuration requires a listener"))?;
        Ok(PipelineConfiguration {
            listener,
            interceptors: self.interceptors,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Arc::new(LoggingErrorHandler)),
            acknowledgement_handler: self
                .acknowledgement_handler
                .unwrap_or_else(|| Arc::new(OnSuccessAcknowledgementHandler)),
        })
    }
}
