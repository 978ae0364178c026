//! Full-batch grant enforcement for always-poll-max configurations.

use std::time::Duration;

use async_trait::async_trait;

use super::{BackPressureHandler, BatchAwareBackPressureHandler, ReleaseReason};

/// Grants permits only in whole batches.
///
/// Placed last in a composite chain: when earlier members limited the grant
/// below a full batch, this handler returns 0, forcing the source into a new
/// requesting round instead of issuing a short poll.
#[derive(Debug)]
pub struct FullBatchBackPressureHandler {
    batch_size: usize,
}

impl FullBatchBackPressureHandler {
    /// Creates a handler for the given batch size.
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

#[async_trait]
impl BackPressureHandler for FullBatchBackPressureHandler {
    async fn request(&self, amount: usize) -> usize {
        if amount >= self.batch_size {
            self.batch_size
        } else {
            0
        }
    }

    fn release(&self, _amount: usize, _reason: ReleaseReason) {}

    async fn drain(&self, _timeout: Duration) -> bool {
        true
    }
}

#[async_trait]
impl BatchAwareBackPressureHandler for FullBatchBackPressureHandler {
    async fn request_batch(&self) -> usize {
        self.request(self.batch_size).await
    }
}
