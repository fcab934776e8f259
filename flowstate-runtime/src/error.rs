//! Runtime error types.

use crate::config::ConfigError;
use flowstate_core::CoreError;
use flowstate_wal::WalError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("runtime shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    /// Stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Io(_) => "INTERNAL_ERROR",
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Wal(WalError::Locked { .. }) => "WAL_LOCKED",
            RuntimeError::Wal(e) if e.is_integrity_violation() => "WAL_CORRUPTED",
            RuntimeError::Wal(_) => "WAL_IO_ERROR",
            RuntimeError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Core(e) => e.is_retryable(),
            RuntimeError::Wal(e) => e.is_retryable(),
            RuntimeError::Io(_) => true,
            RuntimeError::Config(_) | RuntimeError::ShuttingDown => false,
        }
    }
}
