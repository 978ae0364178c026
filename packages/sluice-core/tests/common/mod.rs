//! In-memory broker fakes shared by the integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sluice_core::error::BoxError;
use sluice_core::message::{AckHandle, QueueIdentity, WireMessage};
use sluice_core::source::MessagePoller;

/// Serves pre-seeded batches, then empty polls.
pub struct TestPoller {
    batches: Mutex<VecDeque<Vec<WireMessage>>>,
    requests: Mutex<Vec<usize>>,
    per_call: usize,
}

impl TestPoller {
    pub fn new(batches: Vec<Vec<WireMessage>>, per_call: usize) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            requests: Mutex::new(Vec::new()),
            per_call,
        })
    }

    /// The `max_messages` argument of every poll call, in order.
    pub fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagePoller for TestPoller {
    async fn poll(&self, max_messages: usize) -> Result<Vec<WireMessage>, BoxError> {
        self.requests.lock().unwrap().push(max_messages);
        let batch = self.batches.lock().unwrap().pop_front();
        match batch {
            Some(messages) => Ok(messages.into_iter().take(max_messages).collect()),
            None => {
                // Idle queue: a short wait keeps empty-poll loops tame.
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    fn max_messages_per_call(&self) -> usize {
        self.per_call
    }
}

/// Records every acknowledge call; shared handle, clone freely.
#[derive(Clone, Default)]
pub struct RecordingClient {
    calls: Arc<Mutex<Vec<Vec<AckHandle>>>>,
}

impl RecordingClient {
    pub fn calls(&self) -> Vec<Vec<AckHandle>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acknowledged(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl sluice_core::acknowledgement::AcknowledgementClient for RecordingClient {
    async fn acknowledge(
        &self,
        _queue: &QueueIdentity,
        handles: Vec<AckHandle>,
    ) -> Result<(), BoxError> {
        self.calls.lock().unwrap().push(handles);
        Ok(())
    }
}

/// A batch of wire messages `m-0..m-n` with receipts `r-0..r-n`.
pub fn wire_batch(count: usize) -> Vec<WireMessage> {
    (0..count)
        .map(|i| WireMessage::new(format!("m-{i}"), format!("payload-{i}"), format!("r-{i}")))
        .collect()
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
