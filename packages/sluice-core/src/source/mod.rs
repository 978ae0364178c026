//! The polling message source: the control loop acquiring permits, polling
//! the broker, converting results and handing batches to the sink.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::acknowledgement::AcknowledgementProcessor;
use crate::backpressure::{BatchAwareBackPressureHandler, ReleaseReason};
use crate::error::{BoxError, Error};
use crate::listener::MessageInterceptor;
use crate::message::{MessageConverter, QueueIdentity, WireMessage};
use crate::pipeline::ProcessingContext;
use crate::sink::MessageSink;

mod backoff;
mod tracked;

pub use backoff::BackOffPolicy;

pub(crate) use backoff::BackOffTracker;
pub(crate) use tracked::OutstandingTasks;

/// The broker polling seam, implemented by adapters.
#[async_trait]
pub trait MessagePoller: Send + Sync {
    /// Requests up to `max_messages` messages from the broker. `max_messages`
    /// never exceeds [`MessagePoller::max_messages_per_call`].
    async fn poll(&self, max_messages: usize) -> Result<Vec<WireMessage>, BoxError>;

    /// The broker's per-call maximum. The source issues multiple concurrent
    /// calls and concatenates results when more messages are wanted.
    fn max_messages_per_call(&self) -> usize {
        10
    }
}

/// Lifecycle states of a [`PollingMessageSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Not started, or fully stopped.
    Stopped,
    /// Start requested, components warming up.
    Starting,
    /// Actively acquiring permits and polling.
    Polling,
    /// Sleeping out a poll backoff delay.
    Waiting,
    /// Stop requested, waiting for in-flight work.
    Stopping,
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SourceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> SourceState {
        match self.0.load(Ordering::SeqCst) {
            0 => SourceState::Stopped,
            1 => SourceState::Starting,
            2 => SourceState::Polling,
            3 => SourceState::Waiting,
            _ => SourceState::Stopping,
        }
    }

    fn set(&self, state: SourceState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: SourceState, to: SourceState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Builder for [`PollingMessageSource`].
pub struct PollingMessageSourceBuilder<T> {
    queue: QueueIdentity,
    poller: Option<Arc<dyn MessagePoller>>,
    converter: Option<Arc<dyn MessageConverter<T>>>,
    sink: Option<Arc<dyn MessageSink<T>>>,
    back_pressure: Option<Arc<dyn BatchAwareBackPressureHandler>>,
    acknowledgement_processor: Option<Arc<dyn AcknowledgementProcessor<T>>>,
    context_interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    poll_back_off: BackOffPolicy,
    shutdown_timeout: Duration,
    acknowledgement_shutdown_timeout: Duration,
}

impl<T> fmt::Debug for PollingMessageSourceBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingMessageSourceBuilder")
            .field("queue", &self.queue)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> PollingMessageSourceBuilder<T> {
    /// Sets the broker poller. Required.
    pub fn poller(mut self, poller: Arc<dyn MessagePoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Sets the message converter. Required.
    pub fn converter(mut self, converter: Arc<dyn MessageConverter<T>>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Sets the sink receiving converted batches. Required.
    pub fn sink(mut self, sink: Arc<dyn MessageSink<T>>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the backpressure handler. Required.
    pub fn back_pressure(mut self, handler: Arc<dyn BatchAwareBackPressureHandler>) -> Self {
        self.back_pressure = Some(handler);
        self
    }

    /// Sets the acknowledgement processor. Required.
    pub fn acknowledgement_processor(
        mut self,
        processor: Arc<dyn AcknowledgementProcessor<T>>,
    ) -> Self {
        self.acknowledgement_processor = Some(processor);
        self
    }

    /// Adds interceptors carried in every [`ProcessingContext`].
    pub fn context_interceptors(
        mut self,
        interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    ) -> Self {
        self.context_interceptors = interceptors;
        self
    }

    /// Sets the poll backoff policy.
    pub fn poll_back_off(mut self, policy: BackOffPolicy) -> Self {
        self.poll_back_off = policy;
        self
    }

    /// Sets how long `stop` waits for in-flight work. Zero: best effort.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets how long the acknowledgement processor gets on shutdown.
    pub fn acknowledgement_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.acknowledgement_shutdown_timeout = timeout;
        self
    }

    /// Builds the source.
    pub fn build(self) -> Result<PollingMessageSource<T>, Error> {
        let missing = |part: &str| Error::configuration(format!("message source requires {part}"));
        Ok(PollingMessageSource {
            inner: Arc::new(SourceInner {
                queue: self.queue,
                poller: self.poller.ok_or_else(|| missing("a poller"))?,
                converter: self.converter.ok_or_else(|| missing("a converter"))?,
                sink: self.sink.ok_or_else(|| missing("a sink"))?,
                back_pressure: self
                    .back_pressure
                    .ok_or_else(|| missing("a backpressure handler"))?,
                acknowledgement_processor: self
                    .acknowledgement_processor
                    .ok_or_else(|| missing("an acknowledgement processor"))?,
                context_interceptors: self.context_interceptors,
                poll_back_off: self.poll_back_off,
                back_off: Mutex::new(BackOffTracker::default()),
                shutdown_timeout: self.shutdown_timeout,
                acknowledgement_shutdown_timeout: self.acknowledgement_shutdown_timeout,
                state: StateCell::new(SourceState::Stopped),
                tasks: OutstandingTasks::new(),
            }),
            control: Mutex::new(None),
        })
    }
}

/// Polls a queue continuously, bounded by backpressure, and feeds the
/// processing pipeline through its sink.
///
/// State machine: `Stopped → Starting → Polling ⇄ Waiting → Stopping →
/// Stopped`. Multiple poll cycles may be in flight concurrently up to the
/// permit ceiling; each cycle runs as a tracked task so shutdown waits only
/// on genuinely outstanding work.
pub struct PollingMessageSource<T> {
    inner: Arc<SourceInner<T>>,
    control: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T> fmt::Debug for PollingMessageSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingMessageSource")
            .field("queue", &self.inner.queue)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

struct SourceInner<T> {
    queue: QueueIdentity,
    poller: Arc<dyn MessagePoller>,
    converter: Arc<dyn MessageConverter<T>>,
    sink: Arc<dyn MessageSink<T>>,
    back_pressure: Arc<dyn BatchAwareBackPressureHandler>,
    acknowledgement_processor: Arc<dyn AcknowledgementProcessor<T>>,
    context_interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    poll_back_off: BackOffPolicy,
    back_off: Mutex<BackOffTracker>,
    shutdown_timeout: Duration,
    acknowledgement_shutdown_timeout: Duration,
    state: StateCell,
    tasks: OutstandingTasks,
}

impl<T: Clone + Send + Sync + 'static> PollingMessageSource<T> {
    /// Starts building a source for the given queue.
    pub fn builder(queue: QueueIdentity) -> PollingMessageSourceBuilder<T> {
        PollingMessageSourceBuilder {
            queue,
            poller: None,
            converter: None,
            sink: None,
            back_pressure: None,
            acknowledgement_processor: None,
            context_interceptors: Vec::new(),
            poll_back_off: BackOffPolicy::default(),
            shutdown_timeout: Duration::from_secs(20),
            acknowledgement_shutdown_timeout: Duration::from_secs(20),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.inner.state.get()
    }

    /// Whether the source is accepting and processing work.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            SourceState::Starting | SourceState::Polling | SourceState::Waiting
        )
    }

    /// Starts the polling loop. Must be called from within a tokio runtime;
    /// a no-op when already running.
    pub fn start(&self) {
        if !self
            .inner
            .state
            .transition(SourceState::Stopped, SourceState::Starting)
        {
            tracing::debug!(queue = %self.inner.queue, "message source already running");
            return;
        }
        tracing::debug!(queue = %self.inner.queue, "starting message source");
        self.inner.acknowledgement_processor.start();
        let inner = self.inner.clone();
        let handle = tokio::spawn(control_loop(inner));
        *self.control.lock().unwrap() = Some(handle);
    }

    /// Stops the source: no new polls are issued, in-flight work gets up to
    /// the configured shutdown timeout (zero: don't wait), stragglers are
    /// aborted, and the acknowledgement processor is stopped.
    pub async fn stop(&self) {
        loop {
            let state = self.inner.state.get();
            let stoppable = matches!(
                state,
                SourceState::Starting | SourceState::Polling | SourceState::Waiting
            );
            if !stoppable {
                tracing::debug!(queue = %self.inner.queue, "message source not running");
                return;
            }
            if self.inner.state.transition(state, SourceState::Stopping) {
                break;
            }
        }
        tracing::debug!(queue = %self.inner.queue, "stopping message source");

        let drained = if self.inner.shutdown_timeout.is_zero() {
            tracing::debug!(
                queue = %self.inner.queue,
                "shutdown timeout is zero, not waiting for in-flight work"
            );
            false
        } else {
            self.inner
                .back_pressure
                .drain(self.inner.shutdown_timeout)
                .await
        };
        if !drained {
            let outstanding = self.inner.tasks.outstanding();
            if outstanding > 0 {
                tracing::warn!(
                    queue = %self.inner.queue,
                    outstanding,
                    "in-flight work did not finish in time, aborting"
                );
            }
            self.inner.tasks.abort_all();
        }

        if let Some(control) = self.control.lock().unwrap().take() {
            control.abort();
        }
        self.inner
            .acknowledgement_processor
            .stop(self.inner.acknowledgement_shutdown_timeout)
            .await;
        self.inner.state.set(SourceState::Stopped);
        tracing::debug!(queue = %self.inner.queue, "message source stopped");
    }
}

impl<T> SourceInner<T> {
    fn is_running(&self) -> bool {
        matches!(
            self.state.get(),
            SourceState::Starting | SourceState::Polling | SourceState::Waiting
        )
    }

    fn current_back_off_delay(&self) -> Option<Duration> {
        self.back_off
            .lock()
            .unwrap()
            .current_delay(&self.poll_back_off)
    }
}

impl<T: Clone + Send + Sync + 'static> SourceInner<T> {
    fn create_context(self: &Arc<Self>) -> ProcessingContext<T> {
        let back_pressure = self.back_pressure.clone();
        let release: Arc<dyn Fn() + Send + Sync> =
            Arc::new(move || back_pressure.release(1, ReleaseReason::Processed));
        ProcessingContext::new(self.acknowledgement_processor.clone().callback())
            .with_interceptors(self.context_interceptors.clone())
            .with_backpressure_release(release)
    }
}

async fn control_loop<T: Clone + Send + Sync + 'static>(inner: Arc<SourceInner<T>>) {
    if !inner
        .state
        .transition(SourceState::Starting, SourceState::Polling)
    {
        tracing::debug!(queue = %inner.queue, "source stopped before polling began");
        return;
    }
    loop {
        if !inner.is_running() {
            break;
        }
        if let Some(delay) = inner.current_back_off_delay() {
            tracing::trace!(queue = %inner.queue, ?delay, "backing off before next poll");
            if !inner
                .state
                .transition(SourceState::Polling, SourceState::Waiting)
            {
                break;
            }
            tokio::time::sleep(delay).await;
            if !inner
                .state
                .transition(SourceState::Waiting, SourceState::Polling)
            {
                break;
            }
        }
        let permits = inner.back_pressure.request_batch().await;
        if permits == 0 {
            continue;
        }
        if !inner.is_running() {
            tracing::debug!(
                queue = %inner.queue,
                permits,
                "source stopped after permits were acquired, returning them"
            );
            inner
                .back_pressure
                .release(permits, ReleaseReason::NoneFetched);
            break;
        }
        let cycle = inner.clone();
        inner
            .tasks
            .track(async move { poll_cycle(cycle, permits).await });
    }
    tracing::debug!(queue = %inner.queue, "polling loop stopped");
}

async fn poll_cycle<T: Clone + Send + Sync + 'static>(inner: Arc<SourceInner<T>>, permits: usize) {
    match poll_batch(&inner, permits).await {
        Err(error) => {
            tracing::error!(queue = %inner.queue, %error, "error polling for messages");
            inner.back_off.lock().unwrap().record_failure();
            inner
                .back_pressure
                .release(permits, ReleaseReason::NoneFetched);
        }
        Ok(wire_messages) => {
            {
                let mut back_off = inner.back_off.lock().unwrap();
                if back_off.is_armed() {
                    tracing::trace!(queue = %inner.queue, "polling recovered, resetting backoff");
                    back_off.reset();
                }
            }
            let polled = wire_messages.len();
            let mut messages = Vec::with_capacity(polled);
            for wire in wire_messages {
                let wire_id = wire.message_id.clone();
                match inner.converter.convert(wire) {
                    Ok(message) => messages.push(message),
                    Err(error) => {
                        // One bad message must not fail the batch; its permit
                        // goes straight back.
                        tracing::error!(
                            queue = %inner.queue,
                            message_id = %wire_id,
                            %error,
                            "failed to convert message"
                        );
                        inner.back_pressure.release(1, ReleaseReason::Processed);
                    }
                }
            }
            let unused = permits.saturating_sub(polled);
            let reason = if polled == 0 {
                ReleaseReason::NoneFetched
            } else {
                ReleaseReason::PartialFetch
            };
            inner.back_pressure.release(unused, reason);
            tracing::trace!(
                queue = %inner.queue,
                polled,
                released = unused,
                ?reason,
                "released unused permits"
            );
            if messages.is_empty() {
                return;
            }
            let context = inner.create_context();
            inner.sink.emit(messages, context).await;
        }
    }
}

/// Polls for exactly `count` messages, splitting into multiple concurrent
/// calls when `count` exceeds the broker's per-call maximum and
/// concatenating the results.
async fn poll_batch<T>(
    inner: &Arc<SourceInner<T>>,
    count: usize,
) -> Result<Vec<WireMessage>, Error> {
    let to_poll_error = |source: BoxError| Error::Poll {
        queue: inner.queue.name().to_owned(),
        source,
    };
    let per_call = inner.poller.max_messages_per_call().max(1);
    if count <= per_call {
        return inner.poller.poll(count).await.map_err(to_poll_error);
    }
    let mut calls = Vec::with_capacity(count / per_call + 1);
    for _ in 0..count / per_call {
        calls.push(inner.poller.poll(per_call));
    }
    let remainder = count % per_call;
    if remainder > 0 {
        calls.push(inner.poller.poll(remainder));
    }
    let batches = futures::future::try_join_all(calls)
        .await
        .map_err(to_poll_error)?;
    Ok(batches.into_iter().flatten().collect())
}
