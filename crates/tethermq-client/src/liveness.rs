//! Liveness monitor
//!
//! While a session is installed, runs `keep_alive()` on a fixed period. The
//! first failure is reported through a callback and the monitor exits; it
//! never schedules reconnection itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use tethermq_core::{ConnectionError, ProtocolSession};

/// Periodic keep-alive driver for one session
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    period: Duration,
    op_timeout: Duration,
}

impl LivenessMonitor {
    /// `period` between keep-alives, each bounded by `op_timeout`
    pub const fn new(period: Duration, op_timeout: Duration) -> Self {
        Self { period, op_timeout }
    }

    /// Run until `is_current` turns false or a keep-alive fails.
    ///
    /// `is_current` is checked before every keep-alive, so the monitor stops
    /// as soon as the session is no longer the connected one. On failure
    /// `on_failure` receives [`ConnectionError::KeepAliveFailed`].
    pub async fn run<C, F>(self, session: Arc<dyn ProtocolSession>, is_current: C, on_failure: F)
    where
        C: Fn() -> bool,
        F: FnOnce(ConnectionError),
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !is_current() {
                debug!(client_id = session.client_id(), "Liveness monitor stopping");
                return;
            }

            let failure = match tokio::time::timeout(self.op_timeout, session.keep_alive()).await {
                Ok(Ok(())) => {
                    trace!(client_id = session.client_id(), "Keep-alive ok");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no answer within {:?}", self.op_timeout),
            };

            // Raced with a teardown; not ours to report
            if !is_current() {
                return;
            }
            warn!(client_id = session.client_id(), reason = %failure, "Keep-alive failed");
            on_failure(ConnectionError::KeepAliveFailed(failure));
            return;
        }
    }
}
