//! Error types for highway
//!
//! One taxonomy shared by every stage: channel and shutdown signals,
//! configuration, transport, storage and tensor/data errors.

use thiserror::Error;

/// Primary error type for all highway operations
#[derive(Debug, Error)]
pub enum HighwayError {
    // ========== Channel / Shutdown ==========

    /// A blocking call timed out after the owning stage was asked to stop
    #[error("Stage stopped")]
    Stopped,

    /// The channel has no remaining producer or consumer
    #[error("Channel closed")]
    ChannelClosed,

    // ========== Configuration Errors ==========

    /// Stage, pipeline or store configuration is invalid
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Transform parameters are invalid for the given input
    #[error("Invalid transform {transform}: {reason}")]
    InvalidTransform { transform: &'static str, reason: String },

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // ========== Transport Errors ==========

    /// Could not bind, accept or connect an endpoint
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Malformed wire message
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Payload checksum mismatch
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Storage Errors ==========

    /// Record store operation failed
    #[error("Store operation failed: {0}")]
    Store(#[from] sqlx::Error),

    /// Store path does not exist
    #[error("Store not found: {path}")]
    StoreNotFound { path: String },

    /// A persisted record could not be turned back into a sample
    #[error("Corrupt record {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    // ========== Data Errors ==========

    /// Tensor shape does not match its bytes or its peers
    #[error("Shape mismatch: {reason}")]
    ShapeMismatch { reason: String },

    /// Tensor element type does not match the requested type
    #[error("Dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: String, actual: String },

    /// Batch has no entry under the requested key
    #[error("Missing batch key: {key}")]
    MissingKey { key: String },

    // ========== Runtime Errors ==========

    /// A blocking task panicked or was cancelled
    #[error("Worker task failed: {message}")]
    TaskFailed { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HighwayError {
    /// Returns true if this error is a cooperative shutdown signal
    pub fn is_stopped(&self) -> bool {
        matches!(self, HighwayError::Stopped)
    }

    /// Returns true if the operation may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, HighwayError::ConnectionFailed { .. })
    }

    /// Returns true if this error must terminate the worker that hit it
    ///
    /// Malformed wire data and corrupt records point at version skew or a
    /// bug, so they are never retried.
    pub fn is_fatal(&self) -> bool {
        !self.is_stopped() && !self.is_retryable()
    }

    /// Returns true if this error indicates data corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HighwayError::ChecksumMismatch { .. }
                | HighwayError::InvalidMessage { .. }
                | HighwayError::CorruptRecord { .. }
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        HighwayError::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn message(reason: impl Into<String>) -> Self {
        HighwayError::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        HighwayError::ShapeMismatch {
            reason: reason.into(),
        }
    }
}

/// Result type alias for highway operations
pub type Result<T> = std::result::Result<T, HighwayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(HighwayError::Stopped.is_stopped());
        assert!(!HighwayError::Stopped.is_fatal());

        let conn = HighwayError::ConnectionFailed {
            endpoint: "127.0.0.1:5555".into(),
            reason: "refused".into(),
        };
        assert!(conn.is_retryable());
        assert!(!conn.is_fatal());

        let bad = HighwayError::message("truncated");
        assert!(bad.is_fatal());
        assert!(bad.is_corruption());
    }
}
