//! Error taxonomy for the consumer runtime.
//!
//! Conversion and poll errors are handled locally by the polling source and
//! never terminate the poll loop. Listener and acknowledgement errors travel
//! through the processing pipeline, where the error-handler and
//! acknowledgement stages observe them before re-surfacing them at the top of
//! the invocation.

use thiserror::Error;

use crate::message::{AckHandle, MessageId, QueueIdentity};

/// Boxed error type used at the application-facing seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the consumer runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// A wire message could not be converted into the internal representation.
    /// Isolated per message: it never fails the rest of the batch.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The application listener returned an error or panicked.
    #[error("listener execution failed")]
    Listener {
        /// The listener's error, or a synthesized error for a panic.
        #[source]
        source: BoxError,
    },

    /// An interceptor vetoed or failed while processing a message.
    #[error("interceptor execution failed")]
    Interceptor {
        /// The interceptor's error.
        #[source]
        source: BoxError,
    },

    /// An interceptor returned an empty batch where messages were expected.
    #[error("interceptor must not return an empty batch")]
    EmptyInterceptorResult,

    /// The broker confirmed-delivery call failed.
    #[error(transparent)]
    Acknowledgement(#[from] AcknowledgementError),

    /// A poll request to the broker failed. Triggers the poll backoff policy.
    #[error("polling queue `{queue}` failed")]
    Poll {
        /// Name of the queue being polled.
        queue: String,
        /// The underlying poller error.
        #[source]
        source: BoxError,
    },

    /// A pipeline stage was asked to process a batch it does not support.
    #[error("stage `{stage}` does not support batch processing")]
    BatchUnsupported {
        /// Name of the offending stage.
        stage: &'static str,
    },

    /// The consumer was configured inconsistently.
    #[error("invalid consumer configuration: {reason}")]
    Configuration {
        /// Human-readable description of the problem.
        reason: String,
    },
}

impl Error {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }
}

/// Failure to convert a single wire message into a [`crate::message::Message`].
#[derive(Debug, Error)]
#[error("failed to convert wire message `{message_id}`")]
pub struct ConversionError {
    /// The broker-assigned id of the message that failed to convert.
    pub message_id: String,
    /// The underlying conversion error.
    #[source]
    pub source: BoxError,
}

impl ConversionError {
    /// Creates a conversion error for the given wire message id.
    pub fn new(message_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message_id: message_id.into(),
            source: source.into(),
        }
    }
}

/// A message whose acknowledgement call failed, identified by id and receipt
/// handle so the caller can retry or escalate.
#[derive(Debug, Clone)]
pub struct FailedAck {
    /// Internal id of the message.
    pub id: MessageId,
    /// The receipt handle that was being confirmed.
    pub handle: AckHandle,
}

/// Failure of a broker delete/confirm call.
///
/// Always carries the queue identity and the exact list of messages that
/// failed to acknowledge, whether the underlying client failed before or
/// after suspending.
#[derive(Debug, Error)]
#[error("failed to acknowledge {} message(s) on queue `{queue}`", .failed.len())]
pub struct AcknowledgementError {
    /// The queue the acknowledgement was addressed to.
    pub queue: QueueIdentity,
    /// The messages that were not acknowledged.
    pub failed: Vec<FailedAck>,
    /// The underlying client error.
    #[source]
    pub source: BoxError,
}

impl AcknowledgementError {
    /// Creates an acknowledgement error for the given queue and messages.
    pub fn new(queue: QueueIdentity, failed: Vec<FailedAck>, source: impl Into<BoxError>) -> Self {
        Self {
            queue,
            failed,
            source: source.into(),
        }
    }

    pub(crate) fn interrupted(queue: QueueIdentity) -> Self {
        Self {
            queue,
            failed: Vec::new(),
            source: "acknowledgement task was cancelled before completing".into(),
        }
    }
}
