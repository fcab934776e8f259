//! Transition governor - runs the rule pipeline around a state write.
//!
//! A proposal is handled inside one unit of work on its run:
//!
//! 1. Begin the transaction (waits for the run's lock).
//! 2. Resolve rules for `(current kind, proposed kind)` from the policy.
//!    Core rules are left out for a run in a terminal state unless the
//!    proposal is forced, so no domain side effect precedes terminal
//!    protection.
//! 3. Enter rules in order, running before-hooks, until one rejects or
//!    declares a no-op. Rules rewritten out of scope are skipped.
//! 4. If nothing stopped the pipeline, stage the validated state.
//! 5. Unwind entered rules in reverse order, running after-hooks.
//! 6. Commit (one log record) or roll back.

use crate::context::{Rejection, TransitionContext, TransitionOptions, Verdict};
use crate::error::CoreError;
use crate::kind::StateKind;
use crate::policy::{Policy, RegisteredRule};
use crate::rule::RuleExit;
use crate::state::{ProposedState, State};
use crate::store::RunStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a proposal was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionStatus {
    /// The proposal was committed as submitted.
    Accepted,
    /// A rule substituted a different state, which was committed.
    Rewritten { requested: StateKind, rule: String },
    /// Nothing to do; the run is unchanged.
    NoOp { rule: String, reason: String },
    /// A rule refused the transition; the run is unchanged.
    Rejected(Rejection),
}

/// Outcome of [`TransitionGovernor::propose_transition`].
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub status: TransitionStatus,
    /// The committed state, or the retained current state if nothing was
    /// committed (`None` for a run that has no state yet).
    pub state: Option<State>,
    /// Rules whose before-hooks ran, in order.
    pub entered: Vec<&'static str>,
    /// Rules whose after-hooks ran, in order (the reverse of `entered`).
    pub exited: Vec<&'static str>,
}

impl TransitionResult {
    pub fn is_committed(&self) -> bool {
        matches!(
            self.status,
            TransitionStatus::Accepted | TransitionStatus::Rewritten { .. }
        )
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match &self.status {
            TransitionStatus::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<StateKind> {
        self.state.as_ref().map(|state| state.kind)
    }
}

/// Decides and commits run state transitions.
pub struct TransitionGovernor {
    store: Arc<RunStore>,
    policy: Arc<Policy>,
    lock_timeout: Duration,
}

impl TransitionGovernor {
    pub fn new(store: Arc<RunStore>, policy: Arc<Policy>) -> Self {
        Self {
            lock_timeout: store.lock_timeout(),
            store,
            policy,
        }
    }

    /// Sets how long a proposal waits for its run's lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// Proposes a state with default options.
    pub fn propose(
        &self,
        run_id: Uuid,
        proposed: ProposedState,
    ) -> Result<TransitionResult, CoreError> {
        self.propose_transition(run_id, proposed, TransitionOptions::default())
    }

    /// Proposes a new state for a run.
    ///
    /// Returns the committed state or a reasoned rejection. Errors mean
    /// nothing was committed; retry when [`CoreError::is_retryable`].
    pub fn propose_transition(
        &self,
        run_id: Uuid,
        proposed: ProposedState,
        options: TransitionOptions,
    ) -> Result<TransitionResult, CoreError> {
        let mut txn = self.store.begin(run_id, self.lock_timeout)?;
        let from = txn.initial_state().map(|state| state.kind);
        let to = proposed.kind;
        let settled = from.is_some_and(StateKind::is_terminal) && !options.force;
        let rules = self
            .policy
            .resolve(from, to, options.apply_core_policy && !settled);

        let mut ctx = TransitionContext::new(&mut txn, proposed, options, Utc::now());
        let failure = run_pipeline(&mut ctx, from, &rules);
        let parts = ctx.into_parts();

        if let Some(e) = failure {
            tracing::warn!(%run_id, ?from, %to, error = %e, "Transition failed");
            txn.rollback();
            return Err(e);
        }

        let (status, state) = match parts.verdict {
            Verdict::Proceed => {
                let committed = txn.commit()?;
                let status = match parts.rewritten_by {
                    Some(rule) => TransitionStatus::Rewritten {
                        requested: parts.requested_kind,
                        rule: rule.to_string(),
                    },
                    None => TransitionStatus::Accepted,
                };
                (status, committed.map(|c| c.state))
            }
            Verdict::Rejected(rejection) => {
                let retained = txn.initial_state().cloned();
                txn.rollback();
                (TransitionStatus::Rejected(rejection), retained)
            }
            Verdict::NoOp { rule, reason } => {
                let retained = txn.initial_state().cloned();
                txn.rollback();
                (TransitionStatus::NoOp { rule, reason }, retained)
            }
        };

        tracing::debug!(
            %run_id,
            ?from,
            requested = %to,
            committed = ?state.as_ref().map(|s| s.kind),
            ?status,
            "Transition settled"
        );

        Ok(TransitionResult {
            status,
            state,
            entered: parts.entered,
            exited: parts.exited,
        })
    }
}

/// Enters rules, stages the state and unwinds. Returns the first error.
fn run_pipeline(
    ctx: &mut TransitionContext<'_, '_>,
    from: Option<StateKind>,
    rules: &[&RegisteredRule],
) -> Option<CoreError> {
    let mut stack: Vec<&RegisteredRule> = Vec::with_capacity(rules.len());
    let mut failure = None;

    for &registered in rules {
        if *ctx.verdict() != Verdict::Proceed {
            break;
        }
        if !registered.scope.contains(from, ctx.proposed().kind) {
            continue;
        }

        ctx.set_current_rule(registered.name);
        match registered.rule.before_transition(ctx) {
            Ok(()) => {
                ctx.mark_entered(registered.name);
                stack.push(registered);
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if failure.is_none() && *ctx.verdict() == Verdict::Proceed {
        if let Err(e) = ctx.validate() {
            failure = Some(e);
        }
    }

    while let Some(registered) = stack.pop() {
        let exit = match ctx.validated_state() {
            Some(state) if failure.is_none() && registered.scope.contains(from, state.kind) => {
                RuleExit::Valid
            }
            _ => RuleExit::Invalid,
        };

        ctx.set_current_rule(registered.name);
        if let Err(e) = registered.rule.after_transition(ctx, exit) {
            failure.get_or_insert(e);
        }
        ctx.mark_exited(registered.name);
    }

    failure
}
