//! Acknowledgement processor buffering requests by threshold and interval.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{
    AckDispatcher, AcknowledgementCallback, AcknowledgementExecutor, AcknowledgementProcessor,
    AcknowledgementResultCallback,
};
use crate::config::ConsumerOptions;
use crate::error::{AcknowledgementError, Error};
use crate::message::{Message, QueueIdentity};

const DEFAULT_GROUP: &str = "__default__";

/// Buffers acknowledgements and flushes them in batches.
///
/// Messages are queued per group key on a background task. A group is flushed
/// when it reaches `acknowledgement_threshold` pending messages; everything
/// is flushed when `acknowledgement_interval` elapses since the last flush,
/// whichever comes first. Flushed messages are partitioned into chunks of at
/// most `max_acknowledgements_per_batch`, preserving arrival order, and
/// dispatched under the configured ordering discipline.
///
/// The callback resolves as soon as messages are buffered; execution failures
/// surface through the result callback and the log.
pub struct BatchingAcknowledgementProcessor<T> {
    inner: Arc<BatchingInner<T>>,
}

struct BatchingInner<T> {
    dispatcher: AckDispatcher<T>,
    queue: QueueIdentity,
    threshold: usize,
    interval: Duration,
    running: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<Message<T>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> BatchingAcknowledgementProcessor<T> {
    /// Creates a processor for the given executor and options.
    ///
    /// Fails when both the interval and the threshold are zero; use an
    /// [`super::ImmediateAcknowledgementProcessor`] for that configuration.
    pub fn new(
        executor: Arc<dyn AcknowledgementExecutor<T>>,
        queue: QueueIdentity,
        options: &ConsumerOptions,
        result_callback: Option<Arc<dyn AcknowledgementResultCallback<T>>>,
    ) -> Result<Self, Error> {
        if options.acknowledgement_interval.is_zero() && options.acknowledgement_threshold == 0 {
            return Err(Error::configuration(
                "acknowledgement interval and threshold cannot both be zero; \
                 use immediate acknowledgement instead",
            ));
        }
        Ok(Self {
            inner: Arc::new(BatchingInner {
                dispatcher: AckDispatcher::new(
                    executor,
                    options.acknowledgement_ordering,
                    options.max_acknowledgements_per_batch,
                    queue.clone(),
                    result_callback,
                ),
                queue,
                threshold: options.acknowledgement_threshold,
                interval: options.acknowledgement_interval,
                running: AtomicBool::new(false),
                sender: Mutex::new(None),
                worker: Mutex::new(None),
                in_flight: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl<T> fmt::Debug for BatchingAcknowledgementProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingAcknowledgementProcessor")
            .field("queue", &self.inner.queue)
            .field("threshold", &self.inner.threshold)
            .field("interval", &self.inner.interval)
            .finish()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementProcessor<T>
    for BatchingAcknowledgementProcessor<T>
{
    fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            queue = %self.inner.queue,
            threshold = self.inner.threshold,
            interval = ?self.inner.interval,
            "starting batching acknowledgement processor"
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inner.sender.lock().unwrap() = Some(sender);
        let inner = self.inner.clone();
        let worker = tokio::spawn(buffer_loop(inner, receiver));
        *self.inner.worker.lock().unwrap() = Some(worker);
    }

    async fn stop(&self, timeout: Duration) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return true;
        }
        tracing::debug!(queue = %self.inner.queue, "stopping batching acknowledgement processor");
        // Closing the intake channel makes the buffer task flush what is left
        // and exit.
        let sender = self.inner.sender.lock().unwrap().take();
        drop(sender);

        let deadline = Instant::now() + timeout;
        let worker = self.inner.worker.lock().unwrap().take();
        let mut finished = true;
        if let Some(worker) = worker {
            let abort = worker.abort_handle();
            if tokio::time::timeout_at(deadline, worker).await.is_err() {
                abort.abort();
                finished = false;
            }
        }

        let in_flight: Vec<JoinHandle<()>> =
            self.inner.in_flight.lock().unwrap().drain(..).collect();
        let outstanding = futures::future::join_all(in_flight);
        if tokio::time::timeout_at(deadline, outstanding).await.is_err() {
            tracing::warn!(
                queue = %self.inner.queue,
                "acknowledgement executions did not finish before the shutdown timeout"
            );
            finished = false;
        }
        finished
    }

    fn callback(self: Arc<Self>) -> Arc<dyn AcknowledgementCallback<T>> {
        self
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> AcknowledgementCallback<T>
    for BatchingAcknowledgementProcessor<T>
{
    async fn on_acknowledge(&self, messages: Vec<Message<T>>) -> Result<(), AcknowledgementError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            tracing::debug!(queue = %self.inner.queue, "processor not running, skipping acknowledgement");
            return Ok(());
        }
        let sender = self.inner.sender.lock().unwrap();
        if let Some(sender) = sender.as_ref() {
            for message in messages {
                if sender.send(message).is_err() {
                    tracing::warn!(
                        queue = %self.inner.queue,
                        "acknowledgement buffer closed, dropping acknowledgement"
                    );
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn buffer_loop<T: Clone + Send + Sync + 'static>(
    inner: Arc<BatchingInner<T>>,
    mut receiver: mpsc::UnboundedReceiver<Message<T>>,
) {
    let mut buffers: HashMap<String, Vec<Message<T>>> = HashMap::new();
    let mut last_flush = Instant::now();
    let timed = !inner.interval.is_zero();
    loop {
        let deadline = last_flush + inner.interval;
        tokio::select! {
            received = receiver.recv() => match received {
                Some(message) => {
                    let key = message
                        .group()
                        .map(|g| g.as_str().to_owned())
                        .unwrap_or_else(|| DEFAULT_GROUP.to_owned());
                    buffers.entry(key).or_default().push(message);
                    if inner.threshold > 0 && flush_threshold(&inner, &mut buffers) {
                        last_flush = Instant::now();
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if timed => {
                flush_all(&inner, &mut buffers);
                last_flush = Instant::now();
            }
        }
    }
    // Shutdown: whatever is still buffered goes out now.
    flush_all(&inner, &mut buffers);
    tracing::debug!(queue = %inner.queue, "acknowledgement buffer task stopped");
}

/// Flushes exact-threshold chunks from every group that reached the
/// threshold. Returns whether anything was flushed.
fn flush_threshold<T: Clone + Send + Sync + 'static>(
    inner: &Arc<BatchingInner<T>>,
    buffers: &mut HashMap<String, Vec<Message<T>>>,
) -> bool {
    let mut flushed = false;
    loop {
        let ready: Vec<String> = buffers
            .iter()
            .filter(|(_, pending)| pending.len() >= inner.threshold)
            .map(|(key, _)| key.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for key in ready {
            let batch: Vec<Message<T>> = {
                let pending = buffers.get_mut(&key).expect("group disappeared");
                pending.drain(..inner.threshold).collect()
            };
            spawn_dispatch(inner, batch);
            flushed = true;
        }
    }
    buffers.retain(|_, pending| !pending.is_empty());
    flushed
}

fn flush_all<T: Clone + Send + Sync + 'static>(
    inner: &Arc<BatchingInner<T>>,
    buffers: &mut HashMap<String, Vec<Message<T>>>,
) {
    for (_, pending) in buffers.iter_mut() {
        if !pending.is_empty() {
            let batch: Vec<Message<T>> = pending.drain(..).collect();
            spawn_dispatch(inner, batch);
        }
    }
    buffers.retain(|_, pending| !pending.is_empty());
}

fn spawn_dispatch<T: Clone + Send + Sync + 'static>(
    inner: &Arc<BatchingInner<T>>,
    batch: Vec<Message<T>>,
) {
    tracing::trace!(queue = %inner.queue, count = batch.len(), "flushing acknowledgements");
    let dispatcher = inner.dispatcher.clone();
    let handle = tokio::spawn(async move {
        // Failures are logged and reported through the result callback by the
        // dispatcher itself.
        let _ = dispatcher.dispatch(batch).await;
    });
    let mut in_flight = inner.in_flight.lock().unwrap();
    in_flight.retain(|handle| !handle.is_finished());
    in_flight.push(handle);
}
