//! Throughput-adaptive permit shaping.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// How aggressively the source is currently polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputMode {
    /// The previous poll was empty: a single exploratory batch at a time.
    Low,
    /// The previous poll returned messages: keep requesting full batches.
    High,
}

const LOW: u8 = 0;
const HIGH: u8 = 1;

/// Shapes how many permits are requested per poll based on whether the
/// previous poll returned any messages.
///
/// In [`ThroughputMode::Low`] a single batch may be in flight at a time: one
/// cheap poll discovers whether work exists. A non-empty poll (a release with
/// [`ReleaseReason::PartialFetch`]) switches to [`ThroughputMode::High`],
/// which grants full batches freely; an empty poll
/// ([`ReleaseReason::NoneFetched`]) reverts to low.
///
/// The mode transition is a heuristic inferred from poll results, not a
/// correctness contract; the hard concurrency ceiling is enforced by the
/// [`super::ConcurrencyLimiter`] it composes with.
#[derive(Debug)]
pub struct ThroughputBackPressureHandler {
    batch_size: usize,
    mode: AtomicU8,
    in_flight: AtomicUsize,
    draining: AtomicBool,
}

impl ThroughputBackPressureHandler {
    /// Creates a handler starting in low-throughput mode.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            mode: AtomicU8::new(LOW),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// The current throughput mode.
    pub fn mode(&self) -> ThroughputMode {
        match self.mode.load(Ordering::SeqCst) {
            LOW => ThroughputMode::Low,
            _ => ThroughputMode::High,
        }
    }

    fn set_mode(&self, mode: ThroughputMode) {
        let value = match mode {
            ThroughputMode::Low => LOW,
            ThroughputMode::High => HIGH,
        };
        if self.mode.swap(value, Ordering::SeqCst) != value {
            tracing::debug!(?mode, "throughput mode changed");
        }
    }
}

#[async_trait]
impl BackPressureHandler for ThroughputBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if self.draining.load(Ordering::SeqCst) {
            return 0;
        }
        let granted = match self.mode() {
            ThroughputMode::Low if self.in_flight.load(Ordering::SeqCst) > 0 => 0,
            _ => amount.min(self.batch_size),
        };
        if granted > 0 {
            self.in_flight.fetch_add(granted, Ordering::SeqCst);
        }
        granted
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        match reason {
            ReleaseReason::NoneFetched => self.set_mode(ThroughputMode::Low),
            ReleaseReason::PartialFetch => self.set_mode(ThroughputMode::High),
            ReleaseReason::Processed | ReleaseReason::Limited => {}
        }
        if amount > 0 {
            let _ = self
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(amount))
                });
        }
    }

    async fn drain(&self, _timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        true
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for ThroughputBackPressureHandler {
    async fn request_batch(&self) -> usize {
        self.request(self.batch_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_low_with_one_batch_in_flight() {
        let handler = ThroughputBackPressureHandler::new(10);
        assert_eq!(handler.mode(), ThroughputMode::Low);

        assert_eq!(handler.request(10).await, 10);
        // Low throughput: a second batch is refused while the first is out.
        assert_eq!(handler.request(10).await, 0);
    }

    #[tokio::test]
    async fn non_empty_poll_switches_to_high() {
        let handler = ThroughputBackPressureHandler::new(10);
        assert_eq!(handler.request(10).await, 10);

        // 4 unused permits back: the poll returned 6 messages.
        handler.release(4, ReleaseReason::PartialFetch);
        assert_eq!(handler.mode(), ThroughputMode::High);

        // High throughput: concurrent batches are granted.
        assert_eq!(handler.request(10).await, 10);
        assert_eq!(handler.request(10).await, 10);
    }

    #[tokio::test]
    async fn empty_poll_reverts_to_low() {
        let handler = ThroughputBackPressureHandler::new(10);
        assert_eq!(handler.request(10).await, 10);
        handler.release(0, ReleaseReason::PartialFetch);
        assert_eq!(handler.mode(), ThroughputMode::High);

        handler.release(10, ReleaseReason::NoneFetched);
        assert_eq!(handler.mode(), ThroughputMode::Low);
    }

    #[tokio::test]
    async fn full_fetch_releases_nothing_but_still_signals_high() {
        let handler = ThroughputBackPressureHandler::new(5);
        assert_eq!(handler.request(5).await, 5);

        handler.release(0, ReleaseReason::PartialFetch);
        assert_eq!(handler.mode(), ThroughputMode::High);
    }
}
