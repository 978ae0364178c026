//! Poll backoff policies.

use std::time::Duration;

/// Delay applied between polls after poll failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackOffPolicy {
    /// Retry immediately.
    None,
    /// A constant delay per failed attempt.
    Fixed {
        /// The delay.
        delay: Duration,
    },
    /// Exponentially growing delay, capped.
    Exponential {
        /// Delay after the first failure.
        initial: Duration,
        /// Growth factor per consecutive failure.
        multiplier: u32,
        /// Upper bound for the delay.
        max: Duration,
    },
}

impl Default for BackOffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_millis(500),
            multiplier: 2,
            max: Duration::from_secs(10),
        }
    }
}

impl BackOffPolicy {
    /// The delay before retrying after `attempt` consecutive failures
    /// (0-based).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => Option::None,
            Self::Fixed { delay } => Some(*delay),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.saturating_pow(attempt.min(16));
                Some((*initial * factor).min(*max))
            }
        }
    }
}

/// Tracks consecutive poll failures for a source instance.
///
/// Armed by poll errors, reset by the next successful poll; the polling loop
/// consults it at the top of every iteration.
#[derive(Debug, Default)]
pub(crate) struct BackOffTracker {
    attempts: u32,
}

impl BackOffTracker {
    pub(crate) fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.attempts > 0
    }

    pub(crate) fn current_delay(&self, policy: &BackOffPolicy) -> Option<Duration> {
        if self.attempts == 0 {
            return None;
        }
        policy.delay_for(self.attempts - 1)
    }
}
