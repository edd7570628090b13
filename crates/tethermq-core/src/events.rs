//! Connection notifications and the observer trait.

use bytes::Bytes;

use crate::error::ConnectionError;

/// Notifications produced by the connection controller.
///
/// They are queued together with inbound messages and handed to observers
/// on the owner context during a drain, never from a background task.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A session was installed.
    Connected {
        /// Client identifier of the installed session.
        client_id: String,
    },

    /// A connect attempt failed before the session became healthy.
    ConnectionFailed {
        /// The failure, one of the connect-failure variants.
        error: ConnectionError,
    },

    /// A healthy connection was lost.
    ConnectionLost {
        /// The failure, one of the connection-loss variants.
        error: ConnectionError,
    },

    /// The attempt cap was reached; no retry until `start()`.
    ReconnectExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
    },
}

impl Notification {
    /// Short label for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }
}

/// Receives connection notifications on the owner context.
///
/// Every method has an empty default so observers implement only what they
/// care about.
pub trait ConnectionObserver: Send + Sync {
    /// A session was installed and resubscription was queued.
    fn on_connected(&self) {}

    /// A connect attempt failed; `reason` is human-readable.
    fn on_connection_failed(&self, reason: &str) {
        let _ = reason;
    }

    /// A previously healthy connection was lost.
    fn on_connection_lost(&self, reason: &str) {
        let _ = reason;
    }

    /// A message was taken off the dispatch queue.
    fn on_message_received(&self, topic: &str, payload: &Bytes) {
        let _ = (topic, payload);
    }

    /// The attempt cap was reached. Reported once per attempt sequence.
    fn on_reconnect_exhausted(&self, attempts: u32) {
        let _ = attempts;
    }
}

impl dyn ConnectionObserver {
    /// Route a notification to the matching callback.
    pub fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Connected { .. } => self.on_connected(),
            Notification::ConnectionFailed { error } => {
                self.on_connection_failed(&failure_reason(error));
            }
            Notification::ConnectionLost { error } => {
                self.on_connection_lost(&failure_reason(error));
            }
            Notification::ReconnectExhausted { attempts } => {
                self.on_reconnect_exhausted(*attempts);
            }
        }
    }
}

fn failure_reason(error: &ConnectionError) -> String {
    match error {
        ConnectionError::HandshakeRefused(code) => code.reason(),
        other => other.to_string(),
    }
}
