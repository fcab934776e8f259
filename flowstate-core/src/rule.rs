//! Rules and the transitions they govern.
//!
//! A rule declares a [`TransitionScope`]: one or more (from-set, to-set)
//! pairs over [`StateKind`]. The from-set may include "no prior state" for a
//! run's very first transition. The governor calls a rule's hooks only for
//! transitions inside its scope.

use crate::context::TransitionContext;
use crate::error::CoreError;
use crate::kind::StateKind;
use std::fmt;

/// Set of optional state kinds, stored as a bitmask.
///
/// Bit `i` is `StateKind::ALL[i]`; the bit above the last kind stands for
/// "no prior state".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KindSet(u16);

impl KindSet {
    const NONE_BIT: u16 = 1 << StateKind::ALL.len();
    const KINDS_MASK: u16 = Self::NONE_BIT - 1;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every kind plus "no prior state".
    pub const fn any() -> Self {
        Self(Self::KINDS_MASK | Self::NONE_BIT)
    }

    /// Every kind, excluding "no prior state".
    pub const fn all_kinds() -> Self {
        Self(Self::KINDS_MASK)
    }

    /// Only "no prior state".
    pub const fn none() -> Self {
        Self(Self::NONE_BIT)
    }

    pub fn of(kinds: &[StateKind]) -> Self {
        kinds
            .iter()
            .fold(Self::empty(), |set, &kind| set.with(kind))
    }

    pub fn terminal() -> Self {
        Self::of(&StateKind::TERMINAL)
    }

    pub fn with(self, kind: StateKind) -> Self {
        Self(self.0 | (1 << kind.index()))
    }

    pub fn with_none(self) -> Self {
        Self(self.0 | Self::NONE_BIT)
    }

    pub fn without(self, kind: StateKind) -> Self {
        Self(self.0 & !(1 << kind.index()))
    }

    pub fn contains(&self, kind: Option<StateKind>) -> bool {
        let bit = match kind {
            Some(kind) => 1 << kind.index(),
            None => Self::NONE_BIT,
        };
        self.0 & bit != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in table order: "no prior state" first, then kinds.
    pub fn iter(&self) -> impl Iterator<Item = Option<StateKind>> + '_ {
        std::iter::once(None)
            .chain(StateKind::ALL.into_iter().map(Some))
            .filter(move |kind| self.contains(*kind))
    }
}

impl fmt::Debug for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|k| k.map_or("<none>", StateKind::as_str)))
            .finish()
    }
}

/// Transitions a rule governs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionScope {
    pairs: Vec<(KindSet, KindSet)>,
}

impl TransitionScope {
    pub fn new(from: KindSet, to: KindSet) -> Self {
        Self {
            pairs: vec![(from, to)],
        }
    }

    /// Every transition, including a run's first.
    pub fn everything() -> Self {
        Self::new(KindSet::any(), KindSet::all_kinds())
    }

    /// Adds another (from, to) pair.
    pub fn or(mut self, from: KindSet, to: KindSet) -> Self {
        self.pairs.push((from, to));
        self
    }

    pub fn contains(&self, from: Option<StateKind>, to: StateKind) -> bool {
        self.pairs
            .iter()
            .any(|(f, t)| f.contains(from) && t.contains(Some(to)))
    }

    /// Every concrete (from, to) key in the scope, duplicates removed.
    pub fn keys(&self) -> Vec<(Option<StateKind>, StateKind)> {
        let mut keys = Vec::new();
        for from in KindSet::any().iter() {
            for to in StateKind::ALL {
                if self.contains(from, to) {
                    keys.push((from, to));
                }
            }
        }
        keys
    }
}

/// How a rule's after-hook is told the transition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleExit {
    /// A state was staged and its transition is still inside the rule's
    /// scope. Side effects should be kept.
    Valid,
    /// Nothing was staged (rejection, no-op, error) or the proposal was
    /// rewritten out of the rule's scope. Side effects should be undone.
    Invalid,
}

/// A unit of transition policy.
///
/// Rules are stateless across invocations; everything a rule needs to carry
/// from its before-hook to its after-hook goes through the context's
/// scratch space.
pub trait Rule: Send + Sync {
    /// Name recorded in the entered/exited signature lists.
    fn name(&self) -> &'static str;

    fn scope(&self) -> TransitionScope;

    /// Runs before the transition is staged. May rewrite, reject or no-op
    /// the proposal through the context. An error means the rule was not
    /// entered and its after-hook will not run.
    fn before_transition(&self, _ctx: &mut TransitionContext<'_, '_>) -> Result<(), CoreError> {
        Ok(())
    }

    /// Runs during the unwind, in reverse order of entry.
    fn after_transition(
        &self,
        _ctx: &mut TransitionContext<'_, '_>,
        _exit: RuleExit,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}
