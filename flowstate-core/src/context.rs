//! Per-transition context handed to rules.

use crate::error::CoreError;
use crate::kind::StateKind;
use crate::run::Run;
use crate::slots::SlotAcquire;
use crate::state::{ProposedState, State};
use crate::txn::{Committed, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Caller options for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOptions {
    /// Run the core (domain) rules. Global rules always run.
    pub apply_core_policy: bool,
    /// Allow leaving a terminal state.
    pub force: bool,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self {
            apply_core_policy: true,
            force: false,
        }
    }
}

impl TransitionOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn without_core_policy() -> Self {
        Self {
            apply_core_policy: false,
            ..Self::default()
        }
    }
}

/// Why a transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionKind {
    /// The (from, to) pair is structurally disallowed.
    InvalidTransition,
    /// A rule vetoed an otherwise allowed transition.
    RuleRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub rule: String,
    pub reason: String,
}

/// Decision accumulated by before-hooks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    Proceed,
    Rejected(Rejection),
    NoOp { rule: String, reason: String },
}

/// Mutable view of one transition attempt.
///
/// The initial state is read-only; rules change the outcome only through
/// the proposal, the run's working copy, slots and the scratch space.
pub struct TransitionContext<'t, 's> {
    txn: &'t mut Transaction<'s>,
    proposed: ProposedState,
    requested_kind: StateKind,
    rewritten_by: Option<&'static str>,
    options: TransitionOptions,
    now: DateTime<Utc>,
    verdict: Verdict,
    validated: Option<State>,
    scratch: HashMap<String, Value>,
    entered: Vec<&'static str>,
    exited: Vec<&'static str>,
    current_rule: &'static str,
}

impl<'t, 's> TransitionContext<'t, 's> {
    pub(crate) fn new(
        txn: &'t mut Transaction<'s>,
        proposed: ProposedState,
        options: TransitionOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            txn,
            requested_kind: proposed.kind,
            proposed,
            rewritten_by: None,
            options,
            now,
            verdict: Verdict::Proceed,
            validated: None,
            scratch: HashMap::new(),
            entered: Vec::new(),
            exited: Vec::new(),
            current_rule: "",
        }
    }

    pub fn run(&self) -> &Run {
        self.txn.run()
    }

    /// The run's working copy. Changes are committed with the transition.
    pub fn run_mut(&mut self) -> &mut Run {
        self.txn.run_mut()
    }

    pub fn run_id(&self) -> Uuid {
        self.txn.run_id()
    }

    pub fn initial_state(&self) -> Option<&State> {
        self.txn.initial_state()
    }

    pub fn initial_kind(&self) -> Option<StateKind> {
        self.initial_state().map(|state| state.kind)
    }

    pub fn proposed(&self) -> &ProposedState {
        &self.proposed
    }

    /// The kind the caller asked for, before any rewrite.
    pub fn requested_kind(&self) -> StateKind {
        self.requested_kind
    }

    pub fn options(&self) -> TransitionOptions {
        self.options
    }

    /// Time the transition started.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The state staged for commit; set before after-hooks run.
    pub fn validated_state(&self) -> Option<&State> {
        self.validated.as_ref()
    }

    pub fn entered(&self) -> &[&'static str] {
        &self.entered
    }

    pub fn exited(&self) -> &[&'static str] {
        &self.exited
    }

    // Verdicts

    /// Replaces the proposal. Later rules see the new one.
    pub fn rewrite(&mut self, proposed: ProposedState) {
        tracing::debug!(
            run_id = %self.run_id(),
            rule = self.current_rule,
            from = %self.proposed.kind,
            to = %proposed.kind,
            "Proposal rewritten"
        );
        self.proposed = proposed;
        self.rewritten_by = Some(self.current_rule);
    }

    /// Refuses the transition. No further rules are entered.
    pub fn reject(&mut self, kind: RejectionKind, reason: impl Into<String>) {
        self.verdict = Verdict::Rejected(Rejection {
            kind,
            rule: self.current_rule.to_string(),
            reason: reason.into(),
        });
    }

    /// Accepts the call without writing anything. No further rules are
    /// entered.
    pub fn no_op(&mut self, reason: impl Into<String>) {
        self.verdict = Verdict::NoOp {
            rule: self.current_rule.to_string(),
            reason: reason.into(),
        };
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.verdict, Verdict::Rejected(_))
    }

    // Scratch space

    pub fn scratch(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: Value) {
        self.scratch.insert(key.into(), value);
    }

    pub fn take_scratch(&mut self, key: &str) -> Option<Value> {
        self.scratch.remove(key)
    }

    // Side effects

    /// Reserves a concurrency slot, undone if the transition does not commit.
    pub fn acquire_slot(&mut self, tag: &str) -> SlotAcquire {
        self.txn.acquire_slot(tag)
    }

    /// Releases a held slot when the transition commits.
    pub fn release_slot(&mut self, tag: &str) {
        self.txn.release_slot(tag);
    }

    pub fn held_slots(&self) -> Vec<String> {
        self.txn.held_slots()
    }

    /// Runs `callback` once the transition is durable.
    pub fn on_commit(&mut self, callback: impl FnOnce(&Committed) + Send + 'static) {
        self.txn.on_commit(callback);
    }

    // Governor bookkeeping

    pub(crate) fn set_current_rule(&mut self, name: &'static str) {
        self.current_rule = name;
    }

    pub(crate) fn mark_entered(&mut self, name: &'static str) {
        self.entered.push(name);
    }

    pub(crate) fn mark_exited(&mut self, name: &'static str) {
        self.exited.push(name);
    }

    pub(crate) fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// Builds the state to commit from the proposal and stages it.
    ///
    /// The timestamp never precedes the run's current state. A SCHEDULED
    /// state without a scheduled time is scheduled for its own timestamp.
    pub(crate) fn validate(&mut self) -> Result<(), CoreError> {
        let timestamp = match self.initial_state() {
            Some(initial) if initial.timestamp > self.now => initial.timestamp,
            _ => self.now,
        };
        let scheduled_time = match (self.proposed.kind, self.proposed.scheduled_time) {
            (StateKind::Scheduled, None) => Some(timestamp),
            (_, time) => time,
        };

        let state = State {
            id: Uuid::new_v4(),
            run_id: self.run_id(),
            kind: self.proposed.kind,
            message: self.proposed.message.clone(),
            data: self.proposed.data.clone(),
            scheduled_time,
            timestamp,
        };

        self.txn.stage(state.clone())?;
        self.validated = Some(state);
        Ok(())
    }

    pub(crate) fn into_parts(self) -> ContextParts {
        ContextParts {
            verdict: self.verdict,
            rewritten_by: self.rewritten_by,
            requested_kind: self.requested_kind,
            entered: self.entered,
            exited: self.exited,
        }
    }
}

pub(crate) struct ContextParts {
    pub verdict: Verdict,
    pub rewritten_by: Option<&'static str>,
    pub requested_kind: StateKind,
    pub entered: Vec<&'static str>,
    pub exited: Vec<&'static str>,
}
