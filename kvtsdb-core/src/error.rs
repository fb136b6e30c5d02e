//! Error types for kvtsdb

use crate::UidKind;
use thiserror::Error;

/// Result type alias for kvtsdb operations
pub type Result<T> = std::result::Result<T, TsdbError>;

/// kvtsdb error types
#[derive(Error, Debug)]
pub enum TsdbError {
    /// Entity kind string is not one of metric/tagk/tagv
    #[error("Unsupported type: {0}")]
    UnsupportedKind(String),

    /// A referenced name or id has no binding
    #[error("No such {kind} uid for '{name}'")]
    NotFound { kind: UidKind, name: String },

    /// Batch resolution where some ids did not resolve
    #[error("Unable to resolve {kind} uids: {}", missing.join(", "))]
    PartialLookupFailure { kind: UidKind, missing: Vec<String> },

    /// Commit kept conflicting with concurrent writers
    #[error("Transaction conflict, gave up after {attempts} attempts")]
    TransactionConflict { attempts: u32 },

    /// Underlying store could not serve the request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configured id width cannot represent another id
    #[error("Sequence overflow: {kind} uids exhausted at {width} bytes")]
    SequenceOverflow { kind: UidKind, width: usize },

    /// Caller supplied an invalid value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored data could not be decoded
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Journal frame checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Journal can no longer accept writes; retrying will not help
    #[error("Journal failed: {0}")]
    JournalFailed(String),

    /// Invalid binary format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TsdbError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsdbError::StoreUnavailable(_) | TsdbError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TsdbError::Corruption(_) | TsdbError::ChecksumMismatch { .. }
        )
    }

    pub(crate) fn not_found(kind: UidKind, name: impl Into<String>) -> Self {
        TsdbError::NotFound {
            kind,
            name: name.into(),
        }
    }
}
