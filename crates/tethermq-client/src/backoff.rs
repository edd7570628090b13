//! Reconnection backoff
//!
//! Delays grow geometrically from the policy's initial interval and are
//! capped at its maximum. The sequence is monotonically non-decreasing until
//! [`Backoff::reset`] is called after a successful connect.

use std::time::Duration;

use tethermq_core::ReconnectPolicy;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait `delay`, then run attempt number `attempt` (1-based)
    Retry {
        /// Delay before the next attempt
        delay: Duration,
        /// Number of the attempt that will run after the delay
        attempt: u32,
    },
    /// The attempt cap is reached
    Exhausted {
        /// Consecutive failed attempts
        attempts: u32,
    },
}

/// Backoff state for one attempt sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current_secs: f64,
    failures: u32,
}

impl Backoff {
    /// Create a backoff at its initial interval
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_secs = policy.initial_interval_secs;
        Self {
            policy,
            current_secs,
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// The delay the next failure would be given, without consuming it
    pub fn peek_delay(&self) -> Duration {
        Duration::from_secs_f64(self.current_secs)
    }

    /// Record a failed attempt and decide what happens next.
    pub fn on_failure(&mut self) -> BackoffDecision {
        self.failures = self.failures.saturating_add(1);
        if self.policy.is_bounded() && self.failures >= self.policy.max_attempts {
            return BackoffDecision::Exhausted {
                attempts: self.failures,
            };
        }
        BackoffDecision::Retry {
            delay: self.advance(),
            attempt: self.failures + 1,
        }
    }

    /// Delay for a retry that follows a lost connection. Losses do not count
    /// against the attempt cap.
    pub fn on_loss(&mut self) -> Duration {
        self.advance()
    }

    /// Back to the initial interval with no recorded failures
    pub fn reset(&mut self) {
        self.current_secs = self.policy.initial_interval_secs;
        self.failures = 0;
    }

    fn advance(&mut self) -> Duration {
        let delay = self.current_secs;
        self.current_secs =
            (self.current_secs * self.policy.backoff_multiplier).min(self.policy.max_interval_secs);
        Duration::from_secs_f64(delay)
    }
}
