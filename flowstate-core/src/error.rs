//! Core error types.

use flowstate_wal::WalError;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the transition engine and run store.
///
/// Rule vetoes are not errors; they come back as a rejected
/// [`TransitionResult`](crate::TransitionResult).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: Uuid },

    #[error("run already exists: {run_id}")]
    RunExists { run_id: Uuid },

    #[error("unknown state kind: '{kind}'")]
    UnknownStateKind { kind: String },

    #[error("run {run_id} is locked by another transition (waited {waited_ms}ms)")]
    ConcurrencyContention { run_id: Uuid, waited_ms: u64 },

    #[error("persistence failure: {0}")]
    Persistence(#[from] WalError),

    #[error("rule '{rule}' failed: {reason}")]
    RuleFailed { rule: String, reason: String },

    #[error("a state is already staged for run {run_id}")]
    StateAlreadyStaged { run_id: Uuid },

    #[error("state {state_id} is the current state of run {run_id}")]
    CurrentStateDeletion { state_id: Uuid, run_id: Uuid },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot unusable: {reason}")]
    CorruptSnapshot { reason: String },
}

impl CoreError {
    /// Returns whether the caller may retry the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::ConcurrencyContention { .. } => true,
            CoreError::Persistence(e) => e.is_retryable(),
            CoreError::Io(_) => true,
            _ => false,
        }
    }

    /// Stable error code for callers that report errors over a wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::RunNotFound { .. } => "RUN_NOT_FOUND",
            CoreError::RunExists { .. } => "RUN_EXISTS",
            CoreError::UnknownStateKind { .. } => "BAD_REQUEST",
            CoreError::ConcurrencyContention { .. } => "CONTENTION",
            CoreError::Persistence(WalError::Locked { .. }) => "WAL_LOCKED",
            CoreError::Persistence(e) if e.is_integrity_violation() => "WAL_CORRUPTED",
            CoreError::Persistence(_) => "WAL_IO_ERROR",
            CoreError::RuleFailed { .. } => "RULE_FAILED",
            CoreError::StateAlreadyStaged { .. } => "CONFLICT",
            CoreError::CurrentStateDeletion { .. } => "CONFLICT",
            CoreError::Json(_) => "BAD_REQUEST",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::CorruptSnapshot { .. } => "SNAPSHOT_CORRUPTED",
        }
    }
}
