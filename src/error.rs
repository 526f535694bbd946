//! Error types for the tracker.

use thiserror::Error;

/// Main error type for tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Index not found: {table}.{index}")]
    IndexNotFound { table: String, index: String },

    #[error("Record in {table} has no primary key at `{key_path}`")]
    MissingKey { table: String, key_path: String },

    #[error("Key already exists: {table}[{key}]")]
    ConstraintViolation { table: String, key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote request to {url} failed with status {status}")]
    Remote { status: u16, url: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TrackerError {
    /// Cancellation is an expected outcome of navigation and shutdown, not a
    /// failure worth reporting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TrackerError::Cancelled)
    }

    /// Returns `true` if the upstream/remote answered "not found".
    pub fn is_not_found(&self) -> bool {
        match self {
            TrackerError::Remote { status, .. } => *status == 404,
            TrackerError::Http(e) => e.status().map(|s| s.as_u16()) == Some(404),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            TrackerError::Deserialization(e.to_string())
        } else {
            TrackerError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for TrackerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TrackerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TrackerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TrackerError::Deserialization(e.to_string())
    }
}

/// Result type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;
