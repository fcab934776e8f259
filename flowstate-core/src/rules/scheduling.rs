//! Scheduling and retry rules.

use crate::context::{RejectionKind, TransitionContext};
use crate::error::CoreError;
use crate::kind::StateKind;
use crate::rule::{KindSet, Rule, TransitionScope};
use crate::state::ProposedState;
use chrono::Duration;

/// Holds a scheduled run back until its scheduled time.
pub struct WaitForScheduledTime;

impl Rule for WaitForScheduledTime {
    fn name(&self) -> &'static str {
        "WaitForScheduledTime"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(
            KindSet::of(&[StateKind::Scheduled, StateKind::Late]),
            KindSet::of(&[StateKind::Pending]),
        )
    }

    fn before_transition(&self, ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        let scheduled = ctx.initial_state().and_then(|state| state.scheduled_time);
        if let Some(scheduled) = scheduled {
            if scheduled > ctx.now() {
                let wait = (scheduled - ctx.now()).num_milliseconds();
                ctx.reject(
                    RejectionKind::RuleRejected,
                    format!("scheduled start time is {}ms away", wait),
                );
            }
        }
        Ok(())
    }
}

/// Turns a failure into a rescheduled attempt while retries remain.
///
/// `run_count` counts attempts so far, so a run with `max_retries = n` is
/// attempted at most `n + 1` times.
pub struct RetryFailedRuns;

impl Rule for RetryFailedRuns {
    fn name(&self) -> &'static str {
        "RetryFailedRuns"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(
            KindSet::of(&[StateKind::Running]),
            KindSet::of(&[StateKind::Failed]),
        )
    }

    fn before_transition(&self, ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        let run = ctx.run();
        if run.run_count > run.max_retries {
            return Ok(());
        }

        let attempt = run.run_count;
        let delay = i64::try_from(run.retry_delay_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(Duration::zero);
        let scheduled = ctx
            .now()
            .checked_add_signed(delay)
            .unwrap_or_else(|| ctx.now());
        let retry = ProposedState::new(StateKind::Scheduled)
            .with_message("Retrying")
            .with_data(ctx.proposed().data.clone())
            .scheduled_at(scheduled);

        tracing::debug!(
            run_id = %ctx.run_id(),
            attempt,
            max_retries = ctx.run().max_retries,
            "Rescheduling failed run"
        );
        ctx.rewrite(retry);
        Ok(())
    }
}
