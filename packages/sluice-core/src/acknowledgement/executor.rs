//! Uniform wrapping of the broker delete/confirm call.

use async_trait::async_trait;

use crate::error::{AcknowledgementError, BoxError, FailedAck};
use crate::message::{AckHandle, Message, QueueIdentity};

/// Executes acknowledgement calls against the broker.
#[async_trait]
pub trait AcknowledgementExecutor<T: Send + Sync + 'static>: Send + Sync {
    /// Confirms delivery of the given messages.
    async fn execute(&self, messages: Vec<Message<T>>) -> Result<(), AcknowledgementError>;
}

/// The broker-specific delete/confirm seam, implemented by adapters.
#[async_trait]
pub trait AcknowledgementClient: Send + Sync {
    /// Confirms the given receipt handles on the given queue.
    async fn acknowledge(
        &self,
        queue: &QueueIdentity,
        handles: Vec<AckHandle>,
    ) -> Result<(), BoxError>;
}

/// [`AcknowledgementExecutor`] delegating to an [`AcknowledgementClient`].
///
/// Every client failure, however it surfaces, is wrapped into an
/// [`AcknowledgementError`] retaining the queue identity and the exact
/// messages that failed, so callers never have to distinguish how the
/// underlying call failed and `execute` itself never fails eagerly.
#[derive(Debug)]
pub struct ClientAcknowledgementExecutor<C> {
    client: C,
    queue: QueueIdentity,
}

impl<C> ClientAcknowledgementExecutor<C> {
    /// Creates an executor for the given client and queue.
    pub fn new(client: C, queue: QueueIdentity) -> Self {
        Self { client, queue }
    }

    /// The queue this executor confirms deliveries on.
    pub fn queue(&self) -> &QueueIdentity {
        &self.queue
    }
}

#[async_trait]
impl<T, C> AcknowledgementExecutor<T> for ClientAcknowledgementExecutor<C>
where
    T: Send + Sync + 'static,
    C: AcknowledgementClient,
{
    async fn execute(&self, messages: Vec<Message<T>>) -> Result<(), AcknowledgementError> {
        if messages.is_empty() {
            return Ok(());
        }
        let handles: Vec<AckHandle> = messages.iter().map(|m| m.ack_handle().clone()).collect();
        tracing::trace!(queue = %self.queue, count = handles.len(), "executing acknowledgement");
        match self.client.acknowledge(&self.queue, handles).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let failed = messages
                    .iter()
                    .map(|m| FailedAck {
                        id: m.id(),
                        handle: m.ack_handle().clone(),
                    })
                    .collect();
                Err(AcknowledgementError::new(self.queue.clone(), failed, source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct RecordingClient {
        calls: Mutex<Vec<Vec<AckHandle>>>,
        fail: bool,
    }

    #[async_trait]
    impl AcknowledgementClient for RecordingClient {
        async fn acknowledge(
            &self,
            _queue: &QueueIdentity,
            handles: Vec<AckHandle>,
        ) -> Result<(), BoxError> {
            self.calls.lock().unwrap().push(handles);
            if self.fail {
                // Fails before any suspension point, like a client rejecting
                // the request while building it.
                return Err("connection refused".into());
            }
            Ok(())
        }
    }

    fn queue() -> QueueIdentity {
        QueueIdentity::new("orders", "https://broker.local/orders")
    }

    #[tokio::test]
    async fn confirms_all_handles() {
        let executor = ClientAcknowledgementExecutor::new(
            RecordingClient {
                calls: Mutex::new(Vec::new()),
                fail: false,
            },
            queue(),
        );
        let messages = vec![Message::new(1_u32, "r-1"), Message::new(2_u32, "r-2")];

        executor.execute(messages).await.unwrap();

        let calls = executor.client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![AckHandle::new("r-1"), AckHandle::new("r-2")]);
    }

    #[tokio::test]
    async fn wraps_eager_client_failures_with_queue_identity() {
        let executor = ClientAcknowledgementExecutor::new(
            RecordingClient {
                calls: Mutex::new(Vec::new()),
                fail: true,
            },
            queue(),
        );
        let message = Message::new(1_u32, "r-1");
        let id = message.id();

        let error = executor.execute(vec![message]).await.unwrap_err();

        assert_eq!(error.queue, queue());
        assert_eq!(error.failed.len(), 1);
        assert_eq!(error.failed[0].id, id);
        assert_eq!(error.failed[0].handle, AckHandle::new("r-1"));
    }

    #[tokio::test]
    async fn empty_batches_are_a_no_op() {
        let executor = ClientAcknowledgementExecutor::new(
            RecordingClient {
                calls: Mutex::new(Vec::new()),
                fail: true,
            },
            queue(),
        );

        AcknowledgementExecutor::<u32>::execute(&executor, Vec::new())
            .await
            .unwrap();
        assert!(executor.client.calls.lock().unwrap().is_empty());
    }
}
