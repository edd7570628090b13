//! Error types for CLI operations

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use tethermq_client::ManagerError;
use tethermq_core::{ConfigError, ConnectionError};

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The manager could not be built
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),

    /// The broker could not be reached or the connection failed
    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// Every allowed connect attempt failed
    #[error("Gave up after {attempts} attempts: {reason}")]
    Exhausted {
        /// Consecutive failed attempts
        attempts: u32,
        /// Why the last attempt failed
        reason: String,
    },

    /// Operation timed out
    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// How long it was waited on
        elapsed: Duration,
    },

    /// Invalid command arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// JSON output error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Hints for resolving the error
    pub fn suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(_) | Self::Exhausted { .. } => vec![
                "Check that the broker is running",
                "Verify --host and --port",
                "Run `tethermq probe` to test reachability",
            ],
            Self::Timeout { .. } => vec![
                "Increase the wait with --wait",
                "Verify network connectivity",
            ],
            Self::Config(_) => vec!["Check the file passed with --config"],
            Self::InvalidArguments(_) => vec!["Use --help to see expected arguments"],
            _ => vec![],
        }
    }

    /// Error category for display
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) | Self::Exhausted { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Config(_) | Self::Manager(_) => ErrorCategory::Config,
            Self::InvalidArguments(_) => ErrorCategory::User,
            Self::Json(_) | Self::Io(_) => ErrorCategory::System,
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Broker unreachable or connection failed
    Connection,
    /// Waited too long
    Timeout,
    /// Bad configuration
    Config,
    /// Bad command-line input
    User,
    /// Local I/O or serialization
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "Connection"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Config => write!(f, "Configuration"),
            Self::User => write!(f, "User Input"),
            Self::System => write!(f, "System"),
        }
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// Format an error with its category and hints
pub fn format_error(error: &CliError) -> String {
    let mut out = format!("{} error: {error}", error.category());
    let hints = error.suggestions();
    if !hints.is_empty() {
        out.push_str("\n\nSuggestions:");
        for hint in hints {
            out.push_str("\n  - ");
            out.push_str(hint);
        }
    }
    out
}

/// Print an error to stderr and return the process exit code
#[must_use]
pub fn display_error(error: &CliError) -> i32 {
    eprintln!("{}", format_error(error));
    match error.category() {
        ErrorCategory::User | ErrorCategory::Config => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tethermq_core::RefusalCode;

    #[test]
    fn test_connection_error_formatting() {
        let error = CliError::from(ConnectionError::HandshakeRefused(
            RefusalCode::BadCredentials,
        ));
        let formatted = format_error(&error);
        assert!(formatted.starts_with("Connection error: Connection failed"));
        assert!(formatted.contains("bad username or password"));
        assert!(formatted.contains("tethermq probe"));
    }

    #[test]
    fn test_exit_codes() {
        let user = CliError::InvalidArguments("no topic".into());
        assert_eq!(display_error(&user), 2);

        let timeout = CliError::Timeout {
            operation: "connect",
            elapsed: Duration::from_secs(3),
        };
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert_eq!(display_error(&timeout), 1);
    }
}
