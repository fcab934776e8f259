//! State-entered notifications.

use crate::kind::StateKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published after a transition commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub run_id: Uuid,
    pub run_name: String,
    pub state_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_kind: Option<StateKind>,
    pub to_kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Log sequence number of the commit.
    pub sequence: u64,
}

/// Receiver of committed state events.
///
/// Called after the run has been released. Implementations must not block.
pub trait StateEventSink: Send + Sync {
    fn publish(&self, event: StateEvent);
}
