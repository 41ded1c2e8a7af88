//! Error types for hieravg nodes
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - A per-session recovery policy (remove, ignore, propagate)
//! - User-friendly messages with suggestions
//! - Exit codes for the CLI

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,
    BindFailed = 305,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,
    FrameTooLarge = 404,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a connection handler does when an operation on its session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Close the connection and unregister the session
    Remove,
    /// Log and keep serving the session
    Ignore,
    /// Not a session problem; surface it to the node owner
    Propagate,
}

/// Main error type for hieravg
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: std::path::PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not bind the node's listening socket
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound connection failed
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// A handshake or send did not finish in time
    #[error("Timed out after {timeout_ms}ms waiting to {operation} {addr}")]
    ConnectionTimeout {
        addr: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Peer closed the stream or the socket failed
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Frame payload could not be decoded as a message
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Length prefix exceeds the configured maximum
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    /// A well-formed message arrived where it makes no sense
    #[error("Unexpected {message_type} message from {peer}")]
    UnexpectedMessage {
        message_type: &'static str,
        peer: SocketAddr,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::BindFailed { .. } => ErrorCode::BindFailed,
            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,

            Error::MalformedFrame { .. } => ErrorCode::ProtocolMalformed,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::UnexpectedMessage { .. } => ErrorCode::ProtocolUnexpected,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Recovery policy when this error is raised while serving a session
    pub fn session_action(&self) -> SessionAction {
        match self {
            Error::ConnectionLost { .. }
            | Error::ConnectionTimeout { .. }
            | Error::MalformedFrame { .. }
            | Error::FrameTooLarge { .. }
            | Error::Io(_) => SessionAction::Remove,
            Error::UnexpectedMessage { .. } => SessionAction::Ignore,
            _ => SessionAction::Propagate,
        }
    }

    /// Check if the error is worth retrying (outbound connections only)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::MalformedFrame { .. }
                | Error::Io(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'hieravg config init' to create a default configuration file.",
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'hieravg config validate' to see details.",
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the [schedule] and [node] sections; min_delay_ms must not exceed max_delay_ms.",
            ),
            Error::BindFailed { .. } => Some(
                "Another process may already use this port. Pick a different --port.",
            ),
            Error::ConnectionFailed { .. } => Some(
                "Check that the parent node is running and --parent-host/--parent-port are correct.",
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The peer accepted the connection but stopped responding. Raise node.handshake_timeout_ms or node.send_timeout_ms for slow links.",
            ),
            Error::FrameTooLarge { .. } => Some(
                "Raise node.max_frame_bytes on the receiving node if large vectors are expected.",
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn connection_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.into(),
            message: message.into(),
        }
    }

    pub fn connection_timeout(
        addr: impl Into<String>,
        operation: &'static str,
        timeout: std::time::Duration,
    ) -> Self {
        Error::ConnectionTimeout {
            addr: addr.into(),
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Error::MalformedFrame {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::ConnectionLost.as_str(), "E303");
        assert_eq!(ErrorCode::ProtocolMalformed.as_str(), "E401");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigValidation.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::BindFailed.exit_code(), 30);
        assert_eq!(ErrorCode::FrameTooLarge.exit_code(), 40);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_session_policy_table() {
        assert_eq!(
            Error::connection_lost("eof").session_action(),
            SessionAction::Remove
        );
        assert_eq!(
            Error::malformed_frame("bad json").session_action(),
            SessionAction::Remove
        );
        assert_eq!(
            Error::FrameTooLarge { len: 10, max: 5 }.session_action(),
            SessionAction::Remove
        );
        let unexpected = Error::UnexpectedMessage {
            message_type: "HELLO",
            peer: "127.0.0.1:9".parse().unwrap(),
        };
        assert_eq!(unexpected.session_action(), SessionAction::Ignore);
        assert_eq!(
            Error::Internal("boom".into()).session_action(),
            SessionAction::Propagate
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::connection_failed("127.0.0.1:1", "refused").is_retryable());
        assert!(Error::connection_lost("reset").is_retryable());
        assert!(!Error::config_validation("bad").is_retryable());

        let timeout = Error::connection_timeout("127.0.0.1:1", "receive Hello from", std::time::Duration::from_secs(2));
        assert!(timeout.is_retryable());
        assert_eq!(timeout.session_action(), SessionAction::Remove);
        assert_eq!(timeout.exit_code(), 30);
    }

    #[test]
    fn test_format_for_terminal_includes_hint() {
        let err = Error::connection_failed("10.0.0.1:30000", "refused");
        let out = err.format_for_terminal();
        assert!(out.contains("E300"));
        assert!(out.contains("Hint"));
        assert_eq!(err.format_for_log(), "[E300] Failed to connect to 10.0.0.1:30000: refused");
    }
}
