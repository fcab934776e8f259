//! Global rules.

use crate::context::{RejectionKind, TransitionContext};
use crate::error::CoreError;
use crate::events::{StateEvent, StateEventSink};
use crate::kind::StateKind;
use crate::rule::{KindSet, Rule, RuleExit, TransitionScope};
use std::sync::Arc;

/// Refuses to leave a terminal state unless the caller forces it.
/// Re-proposing the same terminal kind is a no-op.
pub struct TerminalStateProtection;

impl Rule for TerminalStateProtection {
    fn name(&self) -> &'static str {
        "TerminalStateProtection"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(KindSet::terminal(), KindSet::all_kinds())
    }

    fn before_transition(&self, ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        let Some(current) = ctx.initial_kind() else {
            return Ok(());
        };
        let proposed = ctx.proposed().kind;

        if proposed == current {
            ctx.no_op(format!("run is already {}", current));
        } else if ctx.options().force {
            tracing::warn!(
                run_id = %ctx.run_id(),
                from = %current,
                to = %proposed,
                "Forcing transition out of terminal state"
            );
        } else {
            ctx.reject(
                RejectionKind::InvalidTransition,
                format!("run is in terminal state {}, cannot move to {}", current, proposed),
            );
        }
        Ok(())
    }
}

/// Treats a proposal repeating the current state's kind and payload as a
/// no-op, so at-least-once callers can retry safely.
pub struct IdempotentRetryGuard;

impl Rule for IdempotentRetryGuard {
    fn name(&self) -> &'static str {
        "IdempotentRetryGuard"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(KindSet::all_kinds(), KindSet::all_kinds())
    }

    fn before_transition(&self, ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        let repeated = ctx
            .initial_state()
            .is_some_and(|current| ctx.proposed().repeats(current));
        if repeated {
            ctx.no_op("state already applied");
        }
        Ok(())
    }
}

/// Records when the run first started running.
pub struct SetStartTime;

impl Rule for SetStartTime {
    fn name(&self) -> &'static str {
        "SetStartTime"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(KindSet::any(), KindSet::of(&[StateKind::Running]))
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        if exit == RuleExit::Invalid || ctx.run().start_time.is_some() {
            return Ok(());
        }
        if let Some(timestamp) = ctx.validated_state().map(|state| state.timestamp) {
            ctx.run_mut().start_time = Some(timestamp);
        }
        Ok(())
    }
}

/// Records when the run reached a terminal state.
pub struct SetEndTime;

impl Rule for SetEndTime {
    fn name(&self) -> &'static str {
        "SetEndTime"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(KindSet::any(), KindSet::terminal())
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        if exit == RuleExit::Invalid {
            return Ok(());
        }
        if let Some(timestamp) = ctx.validated_state().map(|state| state.timestamp) {
            ctx.run_mut().end_time = Some(timestamp);
        }
        Ok(())
    }
}

/// Counts entries into RUNNING.
pub struct IncrementRunCount;

impl Rule for IncrementRunCount {
    fn name(&self) -> &'static str {
        "IncrementRunCount"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(
            KindSet::any().without(StateKind::Running),
            KindSet::of(&[StateKind::Running]),
        )
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        if exit == RuleExit::Valid {
            let run = ctx.run_mut();
            run.run_count = run.run_count.saturating_add(1);
        }
        Ok(())
    }
}

/// Accumulates time spent in RUNNING.
pub struct IncrementRunTime;

impl Rule for IncrementRunTime {
    fn name(&self) -> &'static str {
        "IncrementRunTime"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(
            KindSet::of(&[StateKind::Running]),
            KindSet::all_kinds().without(StateKind::Running),
        )
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        if exit == RuleExit::Invalid {
            return Ok(());
        }
        let started = ctx.initial_state().map(|state| state.timestamp);
        let ended = ctx.validated_state().map(|state| state.timestamp);
        if let (Some(started), Some(ended)) = (started, ended) {
            let elapsed = (ended - started).num_milliseconds().max(0);
            ctx.run_mut().total_run_time_ms += elapsed;
        }
        Ok(())
    }
}

/// Publishes a [`StateEvent`] for every committed transition.
pub struct EmitStateEvent {
    sink: Arc<dyn StateEventSink>,
}

impl EmitStateEvent {
    pub fn new(sink: Arc<dyn StateEventSink>) -> Self {
        Self { sink }
    }
}

impl Rule for EmitStateEvent {
    fn name(&self) -> &'static str {
        "EmitStateEvent"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::everything()
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        if exit == RuleExit::Invalid {
            return Ok(());
        }

        let sink = self.sink.clone();
        let run_id = ctx.run_id();
        let run_name = ctx.run().name.clone();
        let from_kind = ctx.initial_kind();
        ctx.on_commit(move |committed| {
            sink.publish(StateEvent {
                run_id,
                run_name,
                state_id: committed.state.id,
                from_kind,
                to_kind: committed.state.kind,
                message: committed.state.message.clone(),
                timestamp: committed.state.timestamp,
                sequence: committed.sequence,
            });
        });
        Ok(())
    }
}
