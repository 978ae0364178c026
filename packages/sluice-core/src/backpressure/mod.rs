//! Adaptive backpressure: permit-granting handlers gating how many messages
//! may be polled and processed concurrently.
//!
//! The polling source requests a batch of permits before every poll and
//! releases them as messages finish processing (or immediately, when a poll
//! returns fewer messages than permits were acquired). Handlers compose: the
//! standard stack chains a hard concurrency ceiling with a throughput-shaping
//! handler, each owning a single concern.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackPressureMode, ConsumerOptions};

mod composite;
mod full_batch;
mod limiter;
mod throughput;

pub use composite::CompositeBackPressureHandler;
pub use full_batch::FullBatchBackPressureHandler;
pub use limiter::ConcurrencyLimiter;
pub use throughput::{ThroughputBackPressureHandler, ThroughputMode};

/// Why permits are being returned to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The poll returned no messages; all acquired permits come back.
    NoneFetched,
    /// The poll returned fewer messages than permits acquired; the surplus
    /// comes back. Also used (with amount 0) after a full fetch so handlers
    /// observe that the poll was non-empty.
    PartialFetch,
    /// A message finished its lifecycle (processed, or dropped during
    /// conversion); its permit comes back.
    Processed,
    /// A composite handler limited the grant of one member below what another
    /// member granted; the difference comes back.
    Limited,
}

/// A permit-granting abstraction with no dependency on the rest of the
/// runtime.
#[async_trait]
pub trait BackPressureHandler: Send + Sync {
    /// Requests up to `amount` permits, returning the number granted
    /// (possibly 0). May suspend while waiting for permits.
    async fn request(&self, amount: usize) -> usize;

    /// Returns permits to the handler. Never blocks.
    fn release(&self, amount: usize, reason: ReleaseReason);

    /// Prevents new acquisitions and waits up to `timeout` for in-flight
    /// permits to come back. Returns whether the handler fully drained.
    async fn drain(&self, timeout: Duration) -> bool;
}

/// A handler that knows the configured poll batch size.
#[async_trait]
pub trait BatchAwareBackPressureHandler: BackPressureHandler {
    /// Requests a full batch of permits.
    async fn request_batch(&self) -> usize;
}

/// Builds the standard backpressure stack for the given options.
///
/// - [`BackPressureMode::FixedHighThroughput`]: concurrency limiter only.
/// - [`BackPressureMode::Auto`]: limiter + throughput shaping.
/// - [`BackPressureMode::AlwaysPollMax`]: limiter + throughput shaping +
///   full-batch enforcement, so partial grants force a new requesting round
///   instead of a short poll.
pub fn standard_handler(options: &ConsumerOptions) -> Arc<dyn BatchAwareBackPressureHandler> {
    let limiter = ConcurrencyLimiter::new(
        options.max_concurrent_messages,
        options.max_messages_per_poll,
        options.max_delay_between_polls,
    );
    let mut handlers: Vec<Arc<dyn BackPressureHandler>> = vec![Arc::new(limiter)];
    match options.back_pressure_mode {
        BackPressureMode::FixedHighThroughput => {
            let only = handlers.remove(0);
            return Arc::new(CompositeBackPressureHandler::new(
                vec![only],
                options.max_messages_per_poll,
                options.max_delay_between_polls,
            ));
        }
        BackPressureMode::Auto => {
            handlers.push(Arc::new(ThroughputBackPressureHandler::new(
                options.max_messages_per_poll,
            )));
        }
        BackPressureMode::AlwaysPollMax => {
            handlers.push(Arc::new(ThroughputBackPressureHandler::new(
                options.max_messages_per_poll,
            )));
            // Runs last: a partial grant from the previous members becomes a
            // zero grant, forcing a new requesting round.
            handlers.push(Arc::new(FullBatchBackPressureHandler::new(
                options.max_messages_per_poll,
            )));
        }
    }
    Arc::new(CompositeBackPressureHandler::new(
        handlers,
        options.max_messages_per_poll,
        options.max_delay_between_polls,
    ))
}
