//! WAL error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("WAL is closed")]
    Closed,

    #[error("WAL directory {} is locked by another process", .dir.display())]
    Locked { dir: PathBuf },

    #[error("record {sequence} may or may not be in the log: {reason}")]
    Indeterminate { sequence: u64, reason: String },

    #[error("WAL is poisoned after a failed append; reopen to recover")]
    Poisoned,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WalError {
    /// Returns whether retrying the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalError::Io(_) | WalError::Closed)
    }

    /// Returns whether the error reports damaged or malformed data rather
    /// than a failed write.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            WalError::CorruptedRecord { .. }
                | WalError::InvalidHeader { .. }
                | WalError::RecordTooLarge { .. }
                | WalError::Indeterminate { .. }
                | WalError::Poisoned
        )
    }
}
