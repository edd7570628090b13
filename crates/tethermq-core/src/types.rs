//! Core connection types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of the single logical connection to the broker.
///
/// Exactly one state holds at any time. `Failed` carries the reason of the
/// most recent failed attempt while the next attempt waits on its backoff timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No session and no scheduled attempt.
    #[default]
    Disconnected,
    /// A first connect attempt (or a retry of one) is in flight.
    Connecting,
    /// A session is installed and healthy.
    Connected,
    /// A previously healthy connection was lost; retries are in progress.
    Reconnecting,
    /// The last attempt failed; the next one is scheduled.
    Failed {
        /// A description of the failure reason.
        reason: String,
    },
}

impl ConnectionState {
    /// Returns `true` while an attempt sequence is active, i.e. `start()` has
    /// nothing to do.
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Returns `true` when a session is installed.
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Delivery guarantee requested for subscriptions and publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    #[default]
    AtLeastOnce,
    /// Assured single delivery.
    ExactlyOnce,
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_activity() {
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting.is_active());
        assert!(
            ConnectionState::Failed {
                reason: "no route".into()
            }
            .is_active()
        );
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }

    #[test]
    fn test_state_display() {
        let failed = ConnectionState::Failed {
            reason: "handshake timed out".into(),
        };
        assert_eq!(failed.to_string(), "failed: handshake timed out");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(u8::from(QoS::default()), 1);
        assert_eq!(u8::from(QoS::ExactlyOnce), 2);
    }
}
