//! Concurrency slot rules.

use crate::context::{RejectionKind, TransitionContext};
use crate::error::CoreError;
use crate::kind::StateKind;
use crate::rule::{KindSet, Rule, RuleExit, TransitionScope};
use crate::slots::SlotAcquire;
use crate::state::ProposedState;
use serde_json::Value;

const ACQUIRED_SLOTS: &str = "concurrency.acquired";

/// Takes one slot per limited tag before a run may start.
///
/// When any tag's pool is full the proposal is rewritten to AWAITING_SLOT;
/// a zero limit rejects it outright. Slots taken before the failing tag are
/// given back on exit.
pub struct SecureConcurrencySlots;

impl Rule for SecureConcurrencySlots {
    fn name(&self) -> &'static str {
        "SecureConcurrencySlots"
    }

    fn scope(&self) -> TransitionScope {
        TransitionScope::new(
            KindSet::any().without(StateKind::Running),
            KindSet::of(&[StateKind::Running]),
        )
    }

    fn before_transition(&self, ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        let tags = ctx.run().tags.clone();
        let mut acquired = Vec::new();

        for tag in &tags {
            match ctx.acquire_slot(tag) {
                SlotAcquire::Acquired => acquired.push(Value::String(tag.clone())),
                SlotAcquire::AlreadyHeld | SlotAcquire::Unlimited => {}
                SlotAcquire::ZeroLimit => {
                    ctx.reject(
                        RejectionKind::RuleRejected,
                        format!("concurrency limit for tag '{}' is 0", tag),
                    );
                    break;
                }
                SlotAcquire::Exhausted { limit } => {
                    let waiting = ProposedState::new(StateKind::AwaitingSlot).with_message(
                        format!(
                            "concurrency limit for tag '{}' reached ({} in use)",
                            tag, limit
                        ),
                    );
                    ctx.rewrite(waiting);
                    break;
                }
            }
        }

        ctx.set_scratch(ACQUIRED_SLOTS, Value::Array(acquired));
        Ok(())
    }

    fn after_transition(
        &self,
        ctx: &mut TransitionContext<'_, '_>,
        exit: RuleExit,
    ) -> Result<(), CoreError> {
        let acquired = ctx.take_scratch(ACQUIRED_SLOTS);
        if exit == RuleExit::Valid {
            return Ok(());
        }

        if let Some(Value::Array(tags)) = acquired {
            for tag in tags.iter().filter_map(Value::as_str) {
                ctx.release_slot(tag);
            }
        }
        Ok(())
    }
}

/// Gives back every slot a run holds once it stops running.
pub struct ReleaseConcurrencySlots;

impl Rule for ReleaseConcurrencySlots {
    fn name(&self) -> &'static str {
        "ReleaseConcurrencySlots"
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
        for tag in ctx.held_slots() {
            ctx.release_slot(&tag);
        }
        Ok(())
    }
}
