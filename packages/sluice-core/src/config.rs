//! Consumer configuration.

use std::time::Duration;

use crate::acknowledgement::{AcknowledgementMode, AcknowledgementOrdering};
use crate::error::Error;
use crate::source::BackOffPolicy;

/// How permits are requested relative to broker backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackPressureMode {
    /// Adapt the requested count to observed throughput.
    #[default]
    Auto,
    /// Only ever poll full batches; partial permit grants force a new
    /// requesting round.
    AlwaysPollMax,
    /// Always request full batches without throughput shaping; the
    /// concurrency ceiling is the only limit.
    FixedHighThroughput,
}

/// Whether the listener receives messages one at a time or as whole poll
/// batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// One pipeline invocation per message; messages of a batch are
    /// processed concurrently.
    #[default]
    Single,
    /// One pipeline invocation per poll batch.
    Batch,
}

/// Immutable configuration consumed by the runtime components.
///
/// Built once, validated at startup, and passed by reference into each
/// component's constructor; nothing in here changes per message.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Ceiling for messages in flight (received, not yet acknowledged).
    pub max_concurrent_messages: usize,
    /// Messages requested per poll. Must not exceed
    /// `max_concurrent_messages`.
    pub max_messages_per_poll: usize,
    /// Upper bound on how long a permit request waits before a new
    /// requesting round, and therefore on the delay between polls.
    pub max_delay_between_polls: Duration,
    /// Permit-requesting strategy.
    pub back_pressure_mode: BackPressureMode,
    /// How long acknowledgements may sit in the batching buffer before a
    /// flush. Zero disables the timer.
    pub acknowledgement_interval: Duration,
    /// Pending acknowledgements per group that trigger a flush. Zero
    /// disables threshold flushing.
    pub acknowledgement_threshold: usize,
    /// Chunk size for acknowledgement executor calls.
    pub max_acknowledgements_per_batch: usize,
    /// Concurrency discipline for acknowledgement calls.
    pub acknowledgement_ordering: AcknowledgementOrdering,
    /// When processing outcomes trigger acknowledgement.
    pub acknowledgement_mode: AcknowledgementMode,
    /// Message delivery style for the listener.
    pub listener_mode: ListenerMode,
    /// How long `stop` waits for in-flight polls and processing. Zero means
    /// best effort: don't wait.
    pub listener_shutdown_timeout: Duration,
    /// How long the acknowledgement processor waits for in-flight executor
    /// calls on shutdown.
    pub acknowledgement_shutdown_timeout: Duration,
    /// Backoff applied between polls after poll failures.
    pub poll_back_off: BackOffPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 10,
            max_messages_per_poll: 10,
            max_delay_between_polls: Duration::from_secs(10),
            back_pressure_mode: BackPressureMode::default(),
            acknowledgement_interval: Duration::from_secs(1),
            acknowledgement_threshold: 10,
            max_acknowledgements_per_batch: 10,
            acknowledgement_ordering: AcknowledgementOrdering::default(),
            acknowledgement_mode: AcknowledgementMode::default(),
            listener_mode: ListenerMode::default(),
            listener_shutdown_timeout: Duration::from_secs(20),
            acknowledgement_shutdown_timeout: Duration::from_secs(20),
            poll_back_off: BackOffPolicy::default(),
        }
    }
}

impl ConsumerOptions {
    /// Validates the option set.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent_messages == 0 {
            return Err(Error::configuration(
                "max_concurrent_messages must be at least 1",
            ));
        }
        if self.max_messages_per_poll == 0 {
            return Err(Error::configuration("max_messages_per_poll must be at least 1"));
        }
        if self.max_messages_per_poll > self.max_concurrent_messages {
            return Err(Error::configuration(
                "max_messages_per_poll cannot exceed max_concurrent_messages",
            ));
        }
        if self.max_acknowledgements_per_batch == 0 {
            return Err(Error::configuration(
                "max_acknowledgements_per_batch must be at least 1",
            ));
        }
        Ok(())
    }
}
