//! Tower integration for listeners.

use async_trait::async_trait;
use tower::{Service, ServiceExt};

use sluice_core::error::BoxError;
use sluice_core::listener::MessageListener;
use sluice_core::message::Message;

/// Adapts any [`tower::Service`] over [`Message`]s into a
/// [`MessageListener`], so existing middleware stacks (timeouts, rate
/// limits, retries) can sit in front of the handler.
///
/// The service is cloned per invocation, the usual tower pattern for
/// concurrent calls.
///
/// ```no_run
/// use bytes::Bytes;
/// use sluice::ServiceListener;
/// use sluice::prelude::*;
///
/// let service = tower::util::service_fn(|message: Message<Bytes>| async move {
///     println!("processing {}", message.id());
///     Ok::<_, BoxError>(())
/// });
/// let listener = ServiceListener::new(service);
/// # let _: &dyn MessageListener<Bytes> = &listener;
/// ```
#[derive(Debug, Clone)]
pub struct ServiceListener<S> {
    service: S,
}

impl<S> ServiceListener<S> {
    /// Wraps the given service.
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<T, S> MessageListener<T> for ServiceListener<S>
where
    T: Send + Sync + 'static,
    S: Service<Message<T>> + Clone + Send + Sync + 'static,
    S::Response: Send,
    S::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    async fn on_message(&self, message: Message<T>) -> Result<(), BoxError> {
        let mut service = self.service.clone();
        service.ready().await.map_err(Into::into)?;
        service.call(message).await.map(|_| ()).map_err(Into::into)
    }
}
