//! Error types for the topic log.

use crate::types::Offset;
use thiserror::Error;

/// Main error type for topic operations.
#[derive(Debug, Error)]
pub enum TopicError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested offset has been truncated away. Non-retryable: the
    /// caller's point of reference is permanently gone.
    #[error("Offset {offset} is below head {head}")]
    OffsetBelowHead { offset: Offset, head: Offset },

    /// No data arrived before the pull deadline. Retryable with the same
    /// offset after a backoff.
    #[error("Pull timed out waiting for new messages")]
    PullTimeout,

    #[error("Topic closed: {0}")]
    TopicClosed(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Broker is locked by another process")]
    Locked,

    #[error("Broker not initialized")]
    NotInitialized,
}

impl TopicError {
    /// Whether the caller may retry the failed operation unchanged.
    ///
    /// Only `PullTimeout` is retryable; everything else either invalidates
    /// the caller's offset or reflects a fault the caller cannot fix by
    /// retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TopicError::PullTimeout)
    }
}

impl From<serde_json::Error> for TopicError {
    fn from(e: serde_json::Error) -> Self {
        TopicError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TopicError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TopicError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TopicError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TopicError::Deserialization(e.to_string())
    }
}

/// Result type for topic operations.
pub type Result<T> = std::result::Result<T, TopicError>;
