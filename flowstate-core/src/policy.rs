//! Tiered, ordered rule collections.
//!
//! A [`Policy`] holds core (domain) rules and global (infrastructure) rules.
//! Building it expands every rule's scope into a static table keyed by
//! `(from, to)`, so resolving the rules for a transition is one lookup.
//! Within a tier, rules keep their registration order; core rules always
//! come before global ones.

use crate::events::StateEventSink;
use crate::kind::StateKind;
use crate::rule::{Rule, TransitionScope};
use crate::rules;
use std::sync::Arc;

const FROM_SLOTS: usize = StateKind::ALL.len() + 1;
const TABLE_SIZE: usize = FROM_SLOTS * StateKind::ALL.len();

fn key_index(from: Option<StateKind>, to: StateKind) -> usize {
    let from = from.map_or(0, |kind| kind.index() + 1);
    from * StateKind::ALL.len() + to.index()
}

/// A rule with its scope, captured once at build time.
pub struct RegisteredRule {
    pub rule: Arc<dyn Rule>,
    pub scope: TransitionScope,
    pub name: &'static str,
}

impl RegisteredRule {
    fn new(rule: Arc<dyn Rule>) -> Self {
        Self {
            scope: rule.scope(),
            name: rule.name(),
            rule,
        }
    }
}

struct Tier {
    rules: Vec<RegisteredRule>,
    table: Vec<Vec<usize>>,
}

impl Tier {
    fn build(rules: Vec<Arc<dyn Rule>>) -> Self {
        let rules: Vec<RegisteredRule> = rules.into_iter().map(RegisteredRule::new).collect();
        let mut table = vec![Vec::new(); TABLE_SIZE];

        for (position, registered) in rules.iter().enumerate() {
            for (from, to) in registered.scope.keys() {
                table[key_index(from, to)].push(position);
            }
        }

        Self { rules, table }
    }

    fn resolve(&self, from: Option<StateKind>, to: StateKind) -> impl Iterator<Item = &RegisteredRule> {
        self.table[key_index(from, to)]
            .iter()
            .map(move |&position| &self.rules[position])
    }
}

/// Collects rules into a [`Policy`].
#[derive(Default)]
pub struct PolicyBuilder {
    core: Vec<Arc<dyn Rule>>,
    global: Vec<Arc<dyn Rule>>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a domain rule. Callers may skip the core tier per transition.
    pub fn core_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.core.push(Arc::new(rule));
        self
    }

    /// Appends an infrastructure rule. Always applied.
    pub fn global_rule(mut self, rule: impl Rule + 'static) -> Self {
        self.global.push(Arc::new(rule));
        self
    }

    pub fn build(self) -> Policy {
        Policy {
            core: Tier::build(self.core),
            global: Tier::build(self.global),
        }
    }
}

/// Immutable rule set passed to the governor.
pub struct Policy {
    core: Tier,
    global: Tier,
}

impl Policy {
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// A policy with no rules.
    pub fn empty() -> Self {
        PolicyBuilder::new().build()
    }

    /// The built-in rule set. `sink` receives an event per committed state.
    pub fn standard(sink: Option<Arc<dyn StateEventSink>>) -> Self {
        let mut builder = PolicyBuilder::new()
            .core_rule(rules::WaitForScheduledTime)
            .core_rule(rules::RetryFailedRuns)
            .core_rule(rules::SecureConcurrencySlots)
            .core_rule(rules::ReleaseConcurrencySlots)
            .global_rule(rules::TerminalStateProtection)
            .global_rule(rules::IdempotentRetryGuard)
            .global_rule(rules::SetStartTime)
            .global_rule(rules::SetEndTime)
            .global_rule(rules::IncrementRunCount)
            .global_rule(rules::IncrementRunTime);

        if let Some(sink) = sink {
            builder = builder.global_rule(rules::EmitStateEvent::new(sink));
        }

        builder.build()
    }

    /// Rules for a transition: matching core rules (when enabled) followed
    /// by matching global rules, each in registration order.
    pub fn resolve(
        &self,
        from: Option<StateKind>,
        to: StateKind,
        apply_core: bool,
    ) -> Vec<&RegisteredRule> {
        let core = apply_core
            .then(|| self.core.resolve(from, to))
            .into_iter()
            .flatten();
        core.chain(self.global.resolve(from, to)).collect()
    }

    /// Names of the rules [`resolve`](Self::resolve) returns.
    pub fn rule_names(
        &self,
        from: Option<StateKind>,
        to: StateKind,
        apply_core: bool,
    ) -> Vec<&'static str> {
        self.resolve(from, to, apply_core)
            .into_iter()
            .map(|registered| registered.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.core.rules.len() + self.global.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::KindSet;
    use proptest::prelude::*;

    struct Named(&'static str, TransitionScope);

    impl Rule for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn scope(&self) -> TransitionScope {
            self.1.clone()
        }
    }

    fn to(kinds: &[StateKind]) -> TransitionScope {
        TransitionScope::new(KindSet::any(), KindSet::of(kinds))
    }

    #[test]
    fn test_key_index_is_dense() {
        let mut seen = vec![false; TABLE_SIZE];
        for from in std::iter::once(None).chain(StateKind::ALL.into_iter().map(Some)) {
            for to in StateKind::ALL {
                let index = key_index(from, to);
                assert!(!seen[index]);
                seen[index] = true;
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_core_before_global_in_declaration_order() {
        let policy = Policy::builder()
            .global_rule(Named("g1", TransitionScope::everything()))
            .core_rule(Named("c1", to(&[StateKind::Running])))
            .global_rule(Named("g2", to(&[StateKind::Running])))
            .core_rule(Named("c2", TransitionScope::everything()))
            .build();

        assert_eq!(
            policy.rule_names(Some(StateKind::Pending), StateKind::Running, true),
            vec!["c1", "c2", "g1", "g2"]
        );
        assert_eq!(
            policy.rule_names(Some(StateKind::Pending), StateKind::Running, false),
            vec!["g1", "g2"]
        );
        assert_eq!(
            policy.rule_names(None, StateKind::Scheduled, true),
            vec!["c2", "g1"]
        );
    }

    #[test]
    fn test_standard_policy_tables() {
        let policy = Policy::standard(None);
        assert_eq!(policy.len(), 10);

        assert_eq!(
            policy.rule_names(Some(StateKind::Scheduled), StateKind::Running, true),
            vec![
                "SecureConcurrencySlots",
                "IdempotentRetryGuard",
                "SetStartTime",
                "IncrementRunCount",
            ]
        );
        assert_eq!(
            policy.rule_names(Some(StateKind::Running), StateKind::Failed, true),
            vec![
                "RetryFailedRuns",
                "ReleaseConcurrencySlots",
                "IdempotentRetryGuard",
                "SetEndTime",
                "IncrementRunTime",
            ]
        );
        assert_eq!(
            policy.rule_names(Some(StateKind::Completed), StateKind::Running, false),
            vec![
                "TerminalStateProtection",
                "IdempotentRetryGuard",
                "SetStartTime",
                "IncrementRunCount",
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            from in prop::option::of(prop::sample::select(StateKind::ALL.to_vec())),
            to in prop::sample::select(StateKind::ALL.to_vec()),
            apply_core in any::<bool>(),
        ) {
            let policy = Policy::standard(None);
            let first = policy.rule_names(from, to, apply_core);
            let second = Policy::standard(None).rule_names(from, to, apply_core);
            prop_assert_eq!(&first, &second);

            for name in &first {
                let registered = policy
                    .resolve(from, to, apply_core)
                    .into_iter()
                    .find(|r| r.name == *name)
                    .unwrap();
                prop_assert!(registered.scope.contains(from, to));
            }
        }
    }
}
