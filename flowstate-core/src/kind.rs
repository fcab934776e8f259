//! The closed vocabulary of state kinds.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle kind of a state.
///
/// The serialized names are persisted by clients and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    Scheduled,
    Late,
    AwaitingSlot,
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Crashed,
    Cancelling,
    Cancelled,
}

impl StateKind {
    /// Every kind, in declaration order.
    pub const ALL: [StateKind; 11] = [
        StateKind::Scheduled,
        StateKind::Late,
        StateKind::AwaitingSlot,
        StateKind::Pending,
        StateKind::Running,
        StateKind::Paused,
        StateKind::Completed,
        StateKind::Failed,
        StateKind::Crashed,
        StateKind::Cancelling,
        StateKind::Cancelled,
    ];

    pub const TERMINAL: [StateKind; 4] = [
        StateKind::Completed,
        StateKind::Failed,
        StateKind::Crashed,
        StateKind::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StateKind::Completed | StateKind::Failed | StateKind::Crashed | StateKind::Cancelled
        )
    }

    /// Position in [`StateKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StateKind::Scheduled => "SCHEDULED",
            StateKind::Late => "LATE",
            StateKind::AwaitingSlot => "AWAITING_SLOT",
            StateKind::Pending => "PENDING",
            StateKind::Running => "RUNNING",
            StateKind::Paused => "PAUSED",
            StateKind::Completed => "COMPLETED",
            StateKind::Failed => "FAILED",
            StateKind::Crashed => "CRASHED",
            StateKind::Cancelling => "CANCELLING",
            StateKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStateKind {
                kind: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        for kind in StateKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
            assert_eq!(kind.as_str().parse::<StateKind>().unwrap(), kind);
        }
        assert_eq!(StateKind::AwaitingSlot.to_string(), "AWAITING_SLOT");
    }

    #[test]
    fn test_index_matches_all() {
        for (i, kind) in StateKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_terminal_kinds() {
        let terminal: Vec<_> = StateKind::ALL
            .into_iter()
            .filter(|k| k.is_terminal())
            .collect();
        assert_eq!(terminal.len(), StateKind::TERMINAL.len());
        assert!(StateKind::TERMINAL.iter().all(|k| terminal.contains(k)));
        assert!(!StateKind::Cancelling.is_terminal());
    }

    #[test]
    fn test_unknown_kind() {
        let err = "running".parse::<StateKind>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownStateKind { kind } if kind == "running"));
    }
}
