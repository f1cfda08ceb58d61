//! Error types for the Wardstream core.
//!
//! Every failure the core can produce maps onto one of five handling classes
//! (see [`ErrorClass`]): transient network faults are retried, protocol
//! faults drop the offending frame, an open circuit surfaces as a recovering
//! state, fatal application errors are never retried, and capacity overflows
//! shed the oldest data silently.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Wardstream core.
#[derive(Debug, Error)]
pub enum CoreError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit breaker open for {key}")]
    CircuitOpen { key: String },

    // Wire protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Malformed frame on topic {topic}: {message}")]
    MalformedFrame { topic: String, message: String },

    // Application errors
    #[error("Fatal stream error on topic {topic}: {message}")]
    Fatal { topic: String, message: String },

    #[error("Fault in subtree {component}: {message}")]
    SubtreeFault { component: String, message: String },

    // Capacity errors
    #[error("Capacity exceeded for {resource} (limit {limit})")]
    Capacity { resource: String, limit: usize },

    // Lifecycle errors
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Stream manager is shut down")]
    ShutDown,

    // Telemetry errors
    #[error("Telemetry delivery failed: {message}")]
    Telemetry { message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Wardstream core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Handling class for a [`CoreError`].
///
/// The propagation policy is keyed off this classification: transient and
/// protocol errors stay inside the stream layer, circuit-open is shown as a
/// recovering state, only fatal errors reach the user as hard failures, and
/// capacity errors are never surfaced at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and refused connections, retryable via backoff.
    TransientNetwork,
    /// Malformed frames; drop the frame, keep the connection.
    Protocol,
    /// The breaker is refusing attempts; surfaced as "recovering".
    CircuitOpen,
    /// Explicitly fatal; never retried, user is offered a reload.
    ApplicationFatal,
    /// Buffer or queue overflow; oldest data is shed silently.
    Capacity,
    /// Everything else (config, cancellation, internal bugs).
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransientNetwork => write!(f, "transient-network"),
            ErrorClass::Protocol => write!(f, "protocol"),
            ErrorClass::CircuitOpen => write!(f, "circuit-open"),
            ErrorClass::ApplicationFatal => write!(f, "application-fatal"),
            ErrorClass::Capacity => write!(f, "capacity"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

// Conversion implementations for common error types

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Timeout(Duration::from_secs(0))
        } else {
            CoreError::Transport {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl CoreError {
    /// Classify this error for the propagation policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Transport { .. } | CoreError::Timeout(_) => ErrorClass::TransientNetwork,
            CoreError::Protocol { .. } | CoreError::MalformedFrame { .. } | CoreError::Json { .. } => {
                ErrorClass::Protocol
            }
            CoreError::CircuitOpen { .. } => ErrorClass::CircuitOpen,
            CoreError::Fatal { .. } => ErrorClass::ApplicationFatal,
            CoreError::Capacity { .. } => ErrorClass::Capacity,
            CoreError::SubtreeFault { .. }
            | CoreError::Cancelled
            | CoreError::ShutDown
            | CoreError::Telemetry { .. }
            | CoreError::Config { .. } => ErrorClass::Internal,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient network failures qualify. A fatal error or an open
    /// circuit must never be fed back into a retry loop.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }

    /// Check if this error carries an explicit fatal classification.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::ApplicationFatal
    }
}
