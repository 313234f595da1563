//! Error types for the sync core.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Text must not be empty")]
    EmptyText,

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Write rejected: {0}")]
    Write(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store is closed")]
    Closed,
}

/// Which part of the system a failure belongs to.
///
/// Every failure is terminal for the action that triggered it and is
/// reported to the scope that started it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Sign-in, sign-up, reset, or a missing identity.
    Auth,
    /// Media publish failed; no record was written.
    Upload,
    /// The store rejected a create, or the input was invalid.
    Write,
    /// A live query could not be established or maintained.
    Subscription,
    /// Local persistence (log, blob files, locks).
    Storage,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Auth(_) | SyncError::NotSignedIn => ErrorKind::Auth,
            SyncError::Upload(_) => ErrorKind::Upload,
            SyncError::Write(_) | SyncError::EmptyText | SyncError::DocumentNotFound(_) => {
                ErrorKind::Write
            }
            SyncError::Subscription(_) | SyncError::InvalidQuery(_) => ErrorKind::Subscription,
            SyncError::BlobNotFound(_)
            | SyncError::Io(_)
            | SyncError::Serialization(_)
            | SyncError::Deserialization(_)
            | SyncError::InvalidFormat(_)
            | SyncError::ChecksumMismatch { .. }
            | SyncError::Locked
            | SyncError::Closed => ErrorKind::Storage,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SyncError::NotSignedIn.kind(), ErrorKind::Auth);
        assert_eq!(SyncError::EmptyText.kind(), ErrorKind::Write);
        assert_eq!(SyncError::Upload("x".into()).kind(), ErrorKind::Upload);
        assert_eq!(SyncError::Subscription("x".into()).kind(), ErrorKind::Subscription);
        assert_eq!(SyncError::Locked.kind(), ErrorKind::Storage);
    }
}
