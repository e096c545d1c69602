//! Error types for the dispatch pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Caller-visible failure classes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or invalid credential.
    Unauthenticated,
    /// Operation name not present in the registry.
    UnknownOperation,
    /// Argument schema violation.
    InvalidArguments,
    /// The external process did not finish in time and was terminated.
    Timeout,
    /// The external process exited non-zero or could not be launched.
    ExecutionError,
    /// The admission gate is saturated.
    Busy,
}

impl ErrorKind {
    /// Stable name used in responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::UnknownOperation => "UnknownOperation",
            ErrorKind::InvalidArguments => "InvalidArguments",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::Busy => "Busy",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a single dispatch can fail.
///
/// None of these is fatal to the server; they are all returned to the caller
/// as a typed result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No credential was presented.
    #[error("credential required")]
    MissingCredential,

    /// A credential was presented but is not in the active set.
    #[error("invalid credential")]
    InvalidCredential,

    /// Too many failed attempts from the same client.
    #[error("too many failed authentication attempts, retry later")]
    RateLimited,

    /// The requested operation does not exist.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// An argument failed validation.
    #[error("invalid argument '{field}': {reason}")]
    InvalidArguments {
        /// The offending field, sanitized.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The call could not be decoded at all.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The process exceeded its allotted time.
    #[error("command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The process ran and exited non-zero.
    #[error("command failed with {}: {stderr}", exit_label(.exit_code))]
    ExecutionFailed {
        /// Exit code, absent when the process died from a signal.
        exit_code: Option<i32>,
        /// Captured stderr, truncated.
        stderr: String,
    },

    /// The process could not be started.
    #[error("failed to launch {program}: {reason}")]
    LaunchFailed {
        /// Program path.
        program: String,
        /// The I/O error text.
        reason: String,
    },

    /// No process slot became available.
    #[error("too many concurrent operations, retry later")]
    Busy,

    /// The server stopped waiting for the call during shutdown.
    #[error("gateway is shutting down, call cancelled")]
    ShuttingDown,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_string(),
    }
}

impl DispatchError {
    /// Classify into the caller-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::MissingCredential
            | DispatchError::InvalidCredential
            | DispatchError::RateLimited => ErrorKind::Unauthenticated,
            DispatchError::UnknownOperation(_) => ErrorKind::UnknownOperation,
            DispatchError::InvalidArguments { .. } | DispatchError::MalformedRequest(_) => {
                ErrorKind::InvalidArguments
            }
            DispatchError::Timeout(_) => ErrorKind::Timeout,
            DispatchError::ExecutionFailed { .. } | DispatchError::LaunchFailed { .. } => {
                ErrorKind::ExecutionError
            }
            DispatchError::Busy | DispatchError::ShuttingDown => ErrorKind::Busy,
        }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        DispatchError::InvalidArguments {
            field: sanitize_name(field),
            reason: reason.into(),
        }
    }
}

/// Echo an untrusted name only when it is a plain identifier.
pub fn sanitize_name(name: &str) -> String {
    let plain = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if plain {
        name.to_string()
    } else {
        "<redacted>".to_string()
    }
}
