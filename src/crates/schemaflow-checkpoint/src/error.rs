//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint not found
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Store constructed without a usable tenant id
    #[error("Tenant id is required and must not be blank")]
    MissingTenant,

    /// Operation needs a field the thread reference does not carry
    #[error("Invalid thread reference: {0}")]
    InvalidThread(String),

    /// A checkpoint references a channel version whose blob is absent
    #[error("Missing blob for channel '{channel}' at version {version}")]
    MissingBlob { channel: String, version: u64 },

    /// Different content was offered for an already written blob key
    #[error("Blob conflict for channel '{channel}' at version {version}")]
    BlobConflict { channel: String, version: u64 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("Blob decoding error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Database error from the SQLite backend
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error from the SQLite backend
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    /// True for errors that mean "nothing usable is stored here" rather than a backend fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::MissingBlob { .. })
    }
}
