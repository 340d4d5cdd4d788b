//! Error types for the memory engine.

use thiserror::Error;

use crate::validation::ValidationError;

/// Errors that can occur in the memory engine.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Caller input was rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Requested resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller-supplied id is already in use.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem failure (WAL, data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The vector index is unavailable or failed.
    #[error("Vector backend error: {0}")]
    VectorBackend(String),

    /// An embedding or completion provider failed.
    #[error("Provider error: {0}")]
    Provider(#[from] memoria_llm::LlmError),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Invalid UUID format.
    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    /// Invalid data or state.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration rejected at open.
    #[error("Configuration error: {0}")]
    Config(#[from] memoria_config::ConfigError),
}

/// Coarse error classes used by hosts to pick a response (and by the CLI to
/// pick an exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input: surface to the caller, never retry.
    Validation,
    /// Unknown id.
    NotFound,
    /// Fact store or filesystem failure: fatal for the operation.
    Storage,
    /// Vector index failure: reads degrade, writes report the sub-step.
    VectorBackend,
    /// Embedding or completion provider failure: non-fatal, fall back.
    Provider,
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::DuplicateId(_) | Self::InvalidUuid(_) | Self::Config(_) => {
                ErrorKind::Validation
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::VectorBackend(_) => ErrorKind::VectorBackend,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Database(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Migration(_)
            | Self::InvalidData(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn vector(err: impl std::fmt::Display) -> Self {
        Self::VectorBackend(err.to_string())
    }
}

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            MemoryError::from(ValidationError::EmptyText).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MemoryError::DuplicateId("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(MemoryError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            MemoryError::VectorBackend("down".into()).kind(),
            ErrorKind::VectorBackend
        );
        assert_eq!(
            MemoryError::from(memoria_llm::LlmError::Network("x".into())).kind(),
            ErrorKind::Provider
        );
        assert_eq!(
            MemoryError::Migration("v9".into()).kind(),
            ErrorKind::Storage
        );
    }
}
