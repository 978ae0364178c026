//! Hard concurrency ceiling backed by a counting semaphore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// Enforces `max_concurrent_messages` via a counting semaphore.
///
/// `request` waits up to `acquire_timeout` for the full amount; when the
/// timeout elapses it grants whatever is immediately available instead,
/// possibly nothing. Invariant: available permits stay within
/// `0..=total_permits` for any sequence of acquire/release calls.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    total_permits: usize,
    batch_size: usize,
    acquire_timeout: Duration,
    draining: AtomicBool,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with the given ceiling, batch size and acquisition
    /// timeout.
    pub fn new(total_permits: usize, batch_size: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(total_permits)),
            total_permits,
            batch_size,
            acquire_timeout,
            draining: AtomicBool::new(false),
        }
    }

    /// Permits currently available for acquisition.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn acquire_available(&self, want: usize) -> usize {
        let mut granted = 0;
        while granted < want {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    granted += 1;
                }
                Err(_) => break,
            }
        }
        granted
    }
}

#[async_trait]
impl BackPressureHandler for ConcurrencyLimiter {
    async fn request(&self, amount: usize) -> usize {
        if self.draining.load(Ordering::SeqCst) {
            return 0;
        }
        let want = amount.min(self.total_permits);
        if want == 0 {
            return 0;
        }
        match tokio::time::timeout(self.acquire_timeout, self.semaphore.acquire_many(want as u32))
            .await
        {
            Ok(Ok(permits)) => {
                permits.forget();
                tracing::trace!(
                    granted = want,
                    available = self.semaphore.available_permits(),
                    "acquired permits"
                );
                want
            }
            Ok(Err(_closed)) => 0,
            Err(_elapsed) => {
                let granted = self.acquire_available(want);
                tracing::trace!(
                    requested = want,
                    granted,
                    available = self.semaphore.available_permits(),
                    "acquisition timed out, granted what was available"
                );
                granted
            }
        }
    }

    fn release(&self, amount: usize, reason: ReleaseReason) {
        if amount == 0 {
            return;
        }
        // Available permits never exceed the configured ceiling.
        let headroom = self
            .total_permits
            .saturating_sub(self.semaphore.available_permits());
        self.semaphore.add_permits(amount.min(headroom));
        tracing::trace!(
            released = amount,
            ?reason,
            available = self.semaphore.available_permits(),
            "released permits"
        );
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        let outstanding = self.total_permits - self.semaphore.available_permits();
        tracing::debug!(outstanding, "draining concurrency limiter");
        match tokio::time::timeout(
            timeout,
            self.semaphore.acquire_many(self.total_permits as u32),
        )
        .await
        {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for ConcurrencyLimiter {
    async fn request_batch(&self) -> usize {
        self.request(self.batch_size).await
    }
}
