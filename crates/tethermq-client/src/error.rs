//! Errors raised by the manager itself.
//!
//! Runtime operations (`publish`, `subscribe`, `unsubscribe`) never return
//! errors; failures there are logged. What remains is construction-time
//! failure and the error a subscriber handler may hand back.

use thiserror::Error;

use tethermq_core::ConfigError;

/// Result alias for manager construction
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors from building a [`ConnectionManager`](crate::ConnectionManager)
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ManagerError {
    /// No tokio runtime was supplied and none is current
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// No connector was supplied and no built-in one is compiled in
    #[error("No session connector configured (enable the `mqtt` feature or call with_connector)")]
    MissingConnector,

    /// The configuration did not validate
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error a subscriber handler returns for a message it could not process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any displayable message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_transparent() {
        let err: ManagerError = ConfigError::Invalid {
            field: "port",
            reason: "must be non-zero".into(),
        }
        .into();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_handler_error_display() {
        assert_eq!(HandlerError::from("bad payload").to_string(), "bad payload");
    }
}
