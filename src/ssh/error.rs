//! Error taxonomy and failure classification.
//!
//! Every failure the core surfaces is an [`SshCoreError`]. Whether a failure is
//! worth retrying is decided in exactly one place, [`SshCoreError::is_transient`],
//! based on the variant. Messages coming out of the SSH library are turned into
//! variants once, at the transport boundary, by [`classify_transport_error`].
//!
//! # Classification Strategy
//!
//! 1. **Authentication failures (permanent)**: wrong credentials, rejected keys,
//!    failed MFA. Retrying only risks locking the account.
//!
//! 2. **Connection errors (transient)**: refused, reset, timed out, unreachable.
//!    These may resolve on the next attempt.
//!
//! 3. **Everything else (permanent)**: protocol errors, invalid input, command
//!    timeouts (the command may already have had side effects), open circuits.
//!
//! Authentication patterns take precedence over connection patterns, so a
//! message like "connection closed: authentication failed" is never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::elevation::ElevationAttempt;

/// Result type alias using [`SshCoreError`].
pub type Result<T> = std::result::Result<T, SshCoreError>;

/// Coarse error category, stable across variants' payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ConnectionTimeout,
    Unreachable,
    ConnectionLost,
    AuthenticationFailed,
    Key,
    Protocol,
    CircuitOpen,
    CommandTimeout,
    ElevationUnavailable,
    Cancelled,
}

/// Errors produced by the connection core.
#[derive(Debug, Error)]
pub enum SshCoreError {
    /// Empty host or command, bad port, malformed parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The transport could not be established within the connect timeout.
    #[error("Connection to {host} timed out after {timeout:?}")]
    ConnectionTimeout { host: String, timeout: Duration },

    /// Refused, no route, DNS failure, handshake failure.
    #[error("Host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    /// An established session broke (reset, broken pipe, disconnect).
    #[error("Connection to {host} lost: {reason}")]
    ConnectionLost { host: String, reason: String },

    /// Credentials rejected. `interactive` marks keyboard-interactive/MFA failures.
    #[error("Authentication failed for {user}@{host}: {reason}")]
    AuthenticationFailed {
        host: String,
        user: String,
        reason: String,
        interactive: bool,
    },

    /// A private key could not be read or decrypted.
    #[error("SSH key error ({path}): {reason}")]
    Key { path: String, reason: String },

    /// Unexpected protocol-level failure.
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// The host's circuit breaker is open.
    #[error(
        "Circuit open for {host}: too many recent failures, retry in {}s",
        remaining.as_secs()
    )]
    CircuitOpen { host: String, remaining: Duration },

    /// The command ran past its timeout. It may have left side effects.
    #[error("Command on {host} timed out after {timeout:?}; it may have partially run")]
    CommandTimeout { host: String, timeout: Duration },

    /// Every elevation method was unavailable or failed.
    #[error(
        "No elevation method available on {host} ({}). Clear the elevation cache to retry failed methods",
        describe_attempts(attempts)
    )]
    ElevationUnavailable {
        host: String,
        attempts: Vec<ElevationAttempt>,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SshCoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        SshCoreError::InvalidInput(msg.into())
    }

    pub fn auth(host: &str, user: &str, reason: impl Into<String>) -> Self {
        SshCoreError::AuthenticationFailed {
            host: host.to_string(),
            user: user.to_string(),
            reason: reason.into(),
            interactive: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SshCoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            SshCoreError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SshCoreError::Unreachable { .. } => ErrorKind::Unreachable,
            SshCoreError::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            SshCoreError::AuthenticationFailed { .. } => ErrorKind::AuthenticationFailed,
            SshCoreError::Key { .. } => ErrorKind::Key,
            SshCoreError::Protocol(_) => ErrorKind::Protocol,
            SshCoreError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            SshCoreError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            SshCoreError::ElevationUnavailable { .. } => ErrorKind::ElevationUnavailable,
            SshCoreError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionTimeout | ErrorKind::Unreachable | ErrorKind::ConnectionLost
        )
    }

    /// Whether this failure should count against the host's circuit breaker.
    ///
    /// Caller-side problems and the breaker's own rejection say nothing about
    /// the host's health.
    pub fn counts_against_host(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::InvalidInput
                | ErrorKind::CircuitOpen
                | ErrorKind::Cancelled
                | ErrorKind::ElevationUnavailable
        )
    }
}

fn describe_attempts(attempts: &[ElevationAttempt]) -> String {
    if attempts.is_empty() {
        return "no methods detected".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.method, a.outcome))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Patterns for failures while establishing the transport.
const UNREACHABLE_ERRORS: &[&str] = &[
    "connection refused",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "name or service not known",
    "failed to lookup address",
    "handshake failed",
    "failed to connect",
    "resource temporarily unavailable",
    "would block",
];

/// Patterns for an established session going away underneath us.
const LOST_ERRORS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "disconnect",
    "channel closed",
    "hup",
    "eof",
    "send error",
];

/// Patterns for transport-level timeouts.
const TIMEOUT_ERRORS: &[&str] = &["connection timed out", "timed out", "timeout"];

/// Map a transport library failure message to a typed error.
///
/// This is the only place where library messages are pattern-matched.
/// `default_timeout` is reported when the message is a timeout.
pub fn classify_transport_error(
    host: &str,
    user: &str,
    message: &str,
    default_timeout: Duration,
) -> SshCoreError {
    let lower = message.to_lowercase();

    // Authentication failures are NOT retryable (checked first for priority)
    if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
        return SshCoreError::auth(host, user, message);
    }

    if TIMEOUT_ERRORS.iter().any(|p| lower.contains(p)) {
        return SshCoreError::ConnectionTimeout {
            host: host.to_string(),
            timeout: default_timeout,
        };
    }

    if UNREACHABLE_ERRORS.iter().any(|p| lower.contains(p)) {
        return SshCoreError::Unreachable {
            host: host.to_string(),
            reason: message.to_string(),
        };
    }

    if LOST_ERRORS.iter().any(|p| lower.contains(p)) {
        return SshCoreError::ConnectionLost {
            host: host.to_string(),
            reason: message.to_string(),
        };
    }

    SshCoreError::Protocol(message.to_string())
}
