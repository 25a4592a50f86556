//! Error types for the event store.

use thiserror::Error;

/// Errors raised by a document collection backend.
///
/// These are surfaced to callers unchanged through [`StoreError::Collection`].
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Checksum mismatch at offset {offset}: expected {expected}, got {got}")]
    ChecksumMismatch { offset: u64, expected: u32, got: u32 },

    #[error("Invalid collection format: {0}")]
    InvalidFormat(String),

    #[error("Invalid query on {collection}: {reason}")]
    InvalidQuery { collection: String, reason: String },

    #[error("Database is locked by another process")]
    Locked,

    #[error("Document log {path} refuses writes: batch at offset {offset} was not rolled back ({reason})")]
    Poisoned {
        path: String,
        offset: u64,
        reason: String,
    },

    #[error("Collection {collection} unavailable: {reason}")]
    Unavailable { collection: String, reason: String },
}

impl From<rmp_serde::encode::Error> for CollectionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CollectionError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CollectionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CollectionError::Decode(e.to_string())
    }
}

/// Main error type for repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Entity factory is required")]
    MissingEntity,

    #[error("Invalid entity name: {0:?}")]
    InvalidEntityName(String),

    #[error("Missing required database instance or connection string")]
    MissingDatabase,

    #[error("Unsupported connection string: {0}")]
    UnsupportedUri(String),

    #[error("Snapshot rounds must be at least 1")]
    InvalidRounds,

    #[error("Invalid entity id property")]
    InvalidEntityId,

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    /// True for errors raised while building a repository.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            StoreError::MissingEntity
                | StoreError::InvalidEntityName(_)
                | StoreError::MissingDatabase
                | StoreError::UnsupportedUri(_)
                | StoreError::InvalidRounds
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for collection operations.
pub type CollectionResult<T> = std::result::Result<T, CollectionError>;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
