//! Composition of independent backpressure concerns.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// Chains multiple handlers into one.
///
/// `request` walks the chain front to back, passing each member the minimum
/// granted so far; members that granted more than the final minimum get the
/// surplus back with [`ReleaseReason::Limited`]. `release` fans out to every
/// member. When a round grants nothing, the call waits up to the configured
/// timeout for some permits to be released before returning, so the polling
/// loop does not spin.
pub struct CompositeBackPressureHandler {
    handlers: Vec<Arc<dyn BackPressureHandler>>,
    batch_size: usize,
    no_permits_wait_timeout: Duration,
    released: Notify,
}

impl CompositeBackPressureHandler {
    /// Composes the given handlers. Order matters: earlier members see the
    /// original requested amount, later members see what remains.
    pub fn new(
        handlers: Vec<Arc<dyn BackPressureHandler>>,
        batch_size: usize,
        no_permits_wait_timeout: Duration,
    ) -> Self {
        Self {
            handlers,
            batch_size,
            no_permits_wait_timeout,
            released: Notify::new(),
        }
    }

    async fn wait_for_release(&self) {
        tracing::trace!(
            timeout = ?self.no_permits_wait_timeout,
            "no permits obtained, waiting for a release"
        );
        let _ = tokio::time::timeout(self.no_permits_wait_timeout, self.released.notified()).await;
    }
}

impl fmt::Debug for CompositeBackPressureHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBackPressureHandler")
            .field("handlers", &self.handlers.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[async_trait]
impl BackPressureHandler for CompositeBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        let mut obtained = amount;
        let mut obtained_per_handler = vec![0usize; self.handlers.len()];
        for (i, handler) in self.handlers.iter().enumerate() {
            if obtained == 0 {
                break;
            }
            obtained_per_handler[i] = handler.request(obtained).await;
            obtained = obtained.min(obtained_per_handler[i]);
        }
        for (i, handler) in self.handlers.iter().enumerate() {
            if obtained_per_handler[i] > obtained {
                handler.release(obtained_per_handler[i] - obtained, ReleaseReason::Limited);
            }
        }
        if obtained == 0 {
            self.wait_for_release().await;
        }
        tracing::trace!(requested = amount, obtained, "requested permits");
        obtained
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        for handler in &self.handlers {
            handler.release(amount, reason);
        }
        if amount > 0 {
            self.released.notify_one();
        }
    }

    async fn drain(&self, timeout: Duration) -> bool {
        tracing::debug!("draining backpressure handlers");
        let start = Instant::now();
        let mut drained = true;
        for handler in &self.handlers {
            let remaining = timeout.saturating_sub(start.elapsed());
            drained &= handler.drain(remaining).await;
        }
        drained
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for CompositeBackPressureHandler {
    async fn request_batch(&self) -> usize {
        self.request(self.batch_size).await
    }
}
