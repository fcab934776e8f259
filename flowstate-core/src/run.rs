//! Run records.

use crate::kind::StateKind;
use crate::state::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One tracked unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,

    /// Current state pointer. `None` only before the first transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_kind: Option<StateKind>,

    /// Number of times the run has entered RUNNING.
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_secs: u64,

    #[serde(default)]
    pub tags: Vec<String>,
    /// Weak reference; the parent may have been deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_run_time_ms: i64,
}

impl Run {
    pub fn new(new: NewRun) -> Self {
        Self {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            name: new.name,
            created_at: Utc::now(),
            state_id: None,
            state_kind: None,
            run_count: 0,
            max_retries: new.max_retries,
            retry_delay_secs: new.retry_delay_secs,
            tags: new.tags,
            parent_run_id: new.parent_run_id,
            start_time: None,
            end_time: None,
            total_run_time_ms: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state_kind.is_some_and(StateKind::is_terminal)
    }

    pub(crate) fn point_to(&mut self, state: &State) {
        self.state_id = Some(state.id);
        self.state_kind = Some(state.kind);
    }
}

/// Parameters for creating a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
}

impl NewRun {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_secs: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_secs = retry_delay_secs;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_run_id = Some(parent);
        self
    }
}
