//! Error types: the connection failure taxonomy and session-level errors.

use std::time::Duration;

use thiserror::Error;

/// Result of an operation on a [`ProtocolSession`](crate::ProtocolSession).
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Why a broker refused the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RefusalCode {
    /// The broker does not support the requested protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier was rejected (malformed or already in use).
    IdentifierRejected,
    /// The broker is up but not accepting sessions.
    ServerUnavailable,
    /// The credentials were not accepted.
    BadCredentials,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// Any other refusal code.
    Other(u8),
}

impl RefusalCode {
    /// Human-readable reason used in `on_connection_failed` notifications.
    pub fn reason(&self) -> String {
        match self {
            Self::UnacceptableProtocolVersion => "unacceptable protocol version".to_string(),
            Self::IdentifierRejected => "identifier rejected".to_string(),
            Self::ServerUnavailable => "server unavailable".to_string(),
            Self::BadCredentials => "bad username or password".to_string(),
            Self::NotAuthorized => "not authorized".to_string(),
            Self::Other(code) => format!("refused with code {code}"),
        }
    }
}

impl From<u8> for RefusalCode {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for RefusalCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason())
    }
}

/// The failure taxonomy of the connection manager.
///
/// Connect failures surface through `on_connection_failed`, losses through
/// `on_connection_lost`; both schedule a backoff-driven retry. `HandlerFault`
/// never leaves the dispatch boundary.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConnectionError {
    /// No route or interface to the broker host; no handshake was attempted.
    #[error("No route to broker: {0}")]
    ProbeUnreachable(String),

    /// The probe succeeded but the handshake did not complete in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The broker actively rejected the handshake.
    #[error("Connection refused: {0}")]
    HandshakeRefused(RefusalCode),

    /// The transport failed while the handshake was in progress.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// An established connection closed without a local `stop()`.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The liveness probe could not be sent or acknowledged.
    #[error("Keep-alive failed: {0}")]
    KeepAliveFailed(String),

    /// A subscriber callback failed while processing a delivered message.
    #[error("Handler for '{topic}' failed: {message}")]
    HandlerFault {
        /// Topic of the message being handled
        topic: String,
        /// What the handler reported
        message: String,
    },
}

impl ConnectionError {
    /// `true` for failures of an attempt that never became healthy.
    pub const fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            Self::ProbeUnreachable(_)
                | Self::HandshakeTimeout(_)
                | Self::HandshakeRefused(_)
                | Self::HandshakeFailed(_)
        )
    }

    /// `true` for failures of a connection that was healthy.
    pub const fn is_connection_loss(&self) -> bool {
        matches!(self, Self::TransportClosed(_) | Self::KeepAliveFailed(_))
    }
}

/// Errors returned by [`SessionConnector::connect`](crate::SessionConnector::connect).
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConnectError {
    /// The broker answered the handshake with a refusal.
    #[error("Connection refused: {0}")]
    Refused(RefusalCode),

    /// The transport failed before the handshake completed.
    #[error("Transport error: {0}")]
    Io(String),
}

impl From<ConnectError> for ConnectionError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Refused(code) => Self::HandshakeRefused(code),
            ConnectError::Io(msg) => Self::HandshakeFailed(msg),
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors returned by operations on an established session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    /// The session's transport is gone.
    #[error("Session closed: {0}")]
    Closed(String),

    /// The operation did not complete within its bound.
    #[error("Session operation timed out")]
    Timeout,

    /// The transport reported an I/O failure.
    #[error("IO error: {0}")]
    Io(String),

    /// The broker or the client library rejected the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl SessionError {
    /// `true` when the session can no longer be used.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Configuration error types
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value is out of range
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_code_mapping() {
        assert_eq!(RefusalCode::from(4), RefusalCode::BadCredentials);
        assert_eq!(RefusalCode::from(5).reason(), "not authorized");
        assert_eq!(RefusalCode::from(9).reason(), "refused with code 9");
    }

    #[test]
    fn test_taxonomy_classification() {
        assert!(ConnectionError::ProbeUnreachable("no route".into()).is_connect_failure());
        assert!(ConnectionError::HandshakeTimeout(Duration::from_secs(10)).is_connect_failure());
        assert!(ConnectionError::KeepAliveFailed("ping".into()).is_connection_loss());
        let fault = ConnectionError::HandlerFault {
            topic: "a/b".into(),
            message: "boom".into(),
        };
        assert!(!fault.is_connect_failure());
        assert!(!fault.is_connection_loss());
    }

    #[test]
    fn test_connect_error_conversion() {
        let err: ConnectionError = ConnectError::Refused(RefusalCode::IdentifierRejected).into();
        assert_eq!(err.to_string(), "Connection refused: identifier rejected");

        let err: ConnectionError = ConnectError::Io("reset by peer".into()).into();
        assert!(matches!(err, ConnectionError::HandshakeFailed(_)));
    }

    #[test]
    fn test_session_error_fatality() {
        assert!(SessionError::Closed("eof".into()).is_fatal());
        assert!(!SessionError::Timeout.is_fatal());
        assert!(!SessionError::Rejected("queue full".into()).is_fatal());
    }
}
