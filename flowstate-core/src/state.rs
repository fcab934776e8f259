//! State records and proposals.

use crate::error::CoreError;
use crate::kind::StateKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An immutable point-in-time lifecycle value of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: Uuid,
    pub run_id: Uuid,
    pub kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Opaque result or error payload.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// A state submitted by a caller, not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedState {
    pub kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl ProposedState {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            message: None,
            data: Value::Null,
            scheduled_time: None,
        }
    }

    /// Builds a proposal from a kind name received from a client.
    pub fn parse(kind: &str) -> Result<Self, CoreError> {
        Ok(Self::new(kind.parse()?))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    /// Returns whether this proposal repeats `state` (same kind and payload).
    pub fn repeats(&self, state: &State) -> bool {
        self.kind == state.kind && self.data == state.data
    }
}
