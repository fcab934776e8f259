//! Tag-keyed concurrency slots.
//!
//! A limit caps how many runs carrying a tag may hold a slot at once.
//! Transactions reserve slots eagerly so two runs cannot both see the last
//! free slot; each reservation is recorded in the transaction's
//! [`SlotLedger`] and undone if the transaction does not commit. Releases are
//! recorded too but only applied once the commit is durable.

use crate::snapshot::SlotPoolSnapshot;
use dashmap::DashMap;
use flowstate_wal::SlotChange;
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Outcome of a slot acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquire {
    /// A new slot was reserved.
    Acquired,
    /// The run already holds a slot for this tag.
    AlreadyHeld,
    /// No limit is configured for the tag.
    Unlimited,
    /// Every slot is taken.
    Exhausted { limit: u32 },
    /// The limit is zero; the run can never acquire a slot.
    ZeroLimit,
}

#[derive(Debug, Default)]
struct SlotPool {
    limit: u32,
    holders: BTreeSet<Uuid>,
}

/// Snapshot of one tag's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub tag: String,
    pub limit: u32,
    pub active: u32,
}

/// Concurrency limits and their current holders.
#[derive(Default)]
pub struct ConcurrencySlots {
    pools: DashMap<String, SlotPool>,
}

impl ConcurrencySlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the limit for a tag, keeping current holders.
    pub fn set_limit(&self, tag: &str, limit: u32) {
        self.pools.entry(tag.to_string()).or_default().limit = limit;
    }

    pub fn remove_limit(&self, tag: &str) -> bool {
        self.pools.remove(tag).is_some()
    }

    pub fn limit(&self, tag: &str) -> Option<u32> {
        self.pools.get(tag).map(|pool| pool.limit)
    }

    /// Free slots for a tag, or `None` if it is unlimited.
    pub fn available(&self, tag: &str) -> Option<u32> {
        self.pools
            .get(tag)
            .map(|pool| pool.limit.saturating_sub(pool.holders.len() as u32))
    }

    pub fn holders(&self, tag: &str) -> Vec<Uuid> {
        self.pools
            .get(tag)
            .map(|pool| pool.holders.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn holds(&self, tag: &str, run_id: &Uuid) -> bool {
        self.pools
            .get(tag)
            .is_some_and(|pool| pool.holders.contains(run_id))
    }

    /// Tags for which `run_id` holds a slot.
    pub fn held_by(&self, run_id: &Uuid) -> Vec<String> {
        let mut tags: Vec<String> = self
            .pools
            .iter()
            .filter(|pool| pool.holders.contains(run_id))
            .map(|pool| pool.key().clone())
            .collect();
        tags.sort();
        tags
    }

    pub fn usage(&self) -> Vec<SlotUsage> {
        let mut usage: Vec<SlotUsage> = self
            .pools
            .iter()
            .map(|pool| SlotUsage {
                tag: pool.key().clone(),
                limit: pool.limit,
                active: pool.holders.len() as u32,
            })
            .collect();
        usage.sort_by(|a, b| a.tag.cmp(&b.tag));
        usage
    }

    /// Limits and holders of every pool, ordered by tag.
    pub(crate) fn snapshot(&self) -> Vec<SlotPoolSnapshot> {
        let mut pools: Vec<SlotPoolSnapshot> = self
            .pools
            .iter()
            .map(|pool| SlotPoolSnapshot {
                tag: pool.key().clone(),
                limit: pool.limit,
                holders: pool.holders.iter().copied().collect(),
            })
            .collect();
        pools.sort_by(|a, b| a.tag.cmp(&b.tag));
        pools
    }

    pub(crate) fn restore(&self, pools: Vec<SlotPoolSnapshot>) {
        self.pools.clear();
        for pool in pools {
            self.pools.insert(
                pool.tag,
                SlotPool {
                    limit: pool.limit,
                    holders: pool.holders.into_iter().collect(),
                },
            );
        }
    }

    pub(crate) fn try_acquire(&self, tag: &str, run_id: Uuid) -> SlotAcquire {
        let Some(mut pool) = self.pools.get_mut(tag) else {
            return SlotAcquire::Unlimited;
        };

        if pool.holders.contains(&run_id) {
            return SlotAcquire::AlreadyHeld;
        }
        if pool.limit == 0 {
            return SlotAcquire::ZeroLimit;
        }
        if pool.holders.len() as u32 >= pool.limit {
            return SlotAcquire::Exhausted { limit: pool.limit };
        }

        pool.holders.insert(run_id);
        SlotAcquire::Acquired
    }

    pub(crate) fn release(&self, tag: &str, run_id: &Uuid) -> bool {
        self.pools
            .get_mut(tag)
            .is_some_and(|mut pool| pool.holders.remove(run_id))
    }

    /// Replays a committed slot change.
    pub(crate) fn apply(&self, change: &SlotChange) {
        match change {
            SlotChange::Acquire { tag, run_id } => {
                if let (Ok(run_id), Some(mut pool)) =
                    (Uuid::parse_str(run_id), self.pools.get_mut(tag))
                {
                    pool.holders.insert(run_id);
                }
            }
            SlotChange::Release { tag, run_id } => {
                if let Ok(run_id) = Uuid::parse_str(run_id) {
                    self.release(tag, &run_id);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SlotOp {
    Acquire(String),
    Release(String),
}

/// Slot changes made inside one transaction.
#[derive(Debug, Default)]
pub struct SlotLedger {
    ops: Vec<SlotOp>,
}

impl SlotLedger {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn record_acquire(&mut self, tag: &str) {
        self.ops.push(SlotOp::Acquire(tag.to_string()));
    }

    /// Records a release. Releasing a slot reserved in this same ledger
    /// cancels the reservation instead.
    pub(crate) fn record_release(&mut self, slots: &ConcurrencySlots, tag: &str, run_id: &Uuid) {
        if let Some(pos) = self
            .ops
            .iter()
            .position(|op| matches!(op, SlotOp::Acquire(t) if t == tag))
        {
            self.ops.remove(pos);
            slots.release(tag, run_id);
        } else if !self.releases(tag) {
            self.ops.push(SlotOp::Release(tag.to_string()));
        }
    }

    pub fn acquires(&self, tag: &str) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, SlotOp::Acquire(t) if t == tag))
    }

    pub fn releases(&self, tag: &str) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, SlotOp::Release(t) if t == tag))
    }

    /// Changes in the form written to the log.
    pub(crate) fn changes(&self, run_id: &Uuid) -> Vec<SlotChange> {
        self.ops
            .iter()
            .map(|op| match op {
                SlotOp::Acquire(tag) => SlotChange::Acquire {
                    tag: tag.clone(),
                    run_id: run_id.to_string(),
                },
                SlotOp::Release(tag) => SlotChange::Release {
                    tag: tag.clone(),
                    run_id: run_id.to_string(),
                },
            })
            .collect()
    }

    /// Applies deferred releases after a durable commit.
    pub(crate) fn commit(self, slots: &ConcurrencySlots, run_id: &Uuid) {
        for op in self.ops {
            if let SlotOp::Release(tag) = op {
                slots.release(&tag, run_id);
            }
        }
    }

    /// Undoes reservations of an abandoned transaction.
    pub(crate) fn rollback(&mut self, slots: &ConcurrencySlots, run_id: &Uuid) {
        for op in self.ops.drain(..) {
            if let SlotOp::Acquire(tag) = op {
                slots.release(&tag, run_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("db", 2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(slots.try_acquire("db", a), SlotAcquire::Acquired);
        assert_eq!(slots.try_acquire("db", a), SlotAcquire::AlreadyHeld);
        assert_eq!(slots.try_acquire("db", b), SlotAcquire::Acquired);
        assert_eq!(
            slots.try_acquire("db", c),
            SlotAcquire::Exhausted { limit: 2 }
        );
        assert_eq!(slots.available("db"), Some(0));

        assert!(slots.release("db", &a));
        assert_eq!(slots.available("db"), Some(1));
        assert_eq!(slots.try_acquire("db", c), SlotAcquire::Acquired);
    }

    #[test]
    fn test_unlimited_and_zero_limits() {
        let slots = ConcurrencySlots::new();
        let run = Uuid::new_v4();
        assert_eq!(slots.try_acquire("free", run), SlotAcquire::Unlimited);
        assert_eq!(slots.available("free"), None);

        slots.set_limit("blocked", 0);
        assert_eq!(slots.try_acquire("blocked", run), SlotAcquire::ZeroLimit);
    }

    #[test]
    fn test_ledger_rollback_undoes_reservations_only() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("db", 1);
        slots.set_limit("gpu", 1);
        let run = Uuid::new_v4();
        slots.try_acquire("gpu", run);

        let mut ledger = SlotLedger::default();
        assert_eq!(slots.try_acquire("db", run), SlotAcquire::Acquired);
        ledger.record_acquire("db");
        ledger.record_release(&slots, "gpu", &run);

        ledger.rollback(&slots, &run);
        assert!(!slots.holds("db", &run));
        assert!(slots.holds("gpu", &run));
    }

    #[test]
    fn test_ledger_commit_applies_releases() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("db", 1);
        let run = Uuid::new_v4();
        slots.try_acquire("db", run);

        let mut ledger = SlotLedger::default();
        ledger.record_release(&slots, "db", &run);
        assert!(slots.holds("db", &run));
        assert_eq!(ledger.changes(&run).len(), 1);

        ledger.commit(&slots, &run);
        assert!(!slots.holds("db", &run));
    }

    #[test]
    fn test_release_cancels_own_reservation() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("db", 1);
        let run = Uuid::new_v4();

        let mut ledger = SlotLedger::default();
        slots.try_acquire("db", run);
        ledger.record_acquire("db");
        ledger.record_release(&slots, "db", &run);

        assert!(ledger.is_empty());
        assert_eq!(slots.available("db"), Some(1));
    }

    #[test]
    fn test_replay_and_usage() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("db", 3);
        let run = Uuid::new_v4();

        slots.apply(&SlotChange::Acquire {
            tag: "db".to_string(),
            run_id: run.to_string(),
        });
        assert_eq!(slots.holders("db"), vec![run]);
        assert_eq!(slots.held_by(&run), vec!["db".to_string()]);
        assert_eq!(
            slots.usage(),
            vec![SlotUsage {
                tag: "db".to_string(),
                limit: 3,
                active: 1
            }]
        );

        slots.apply(&SlotChange::Release {
            tag: "db".to_string(),
            run_id: run.to_string(),
        });
        assert!(slots.holders("db").is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let slots = ConcurrencySlots::new();
        slots.set_limit("gpu", 1);
        slots.set_limit("db", 2);
        let run = Uuid::new_v4();
        slots.try_acquire("db", run);

        let pools = slots.snapshot();
        assert_eq!(
            pools.iter().map(|p| p.tag.as_str()).collect::<Vec<_>>(),
            vec!["db", "gpu"]
        );

        let restored = ConcurrencySlots::new();
        restored.set_limit("stale", 5);
        restored.restore(pools);
        assert_eq!(restored.limit("stale"), None);
        assert_eq!(restored.holders("db"), vec![run]);
        assert_eq!(restored.available("db"), Some(1));
        assert_eq!(restored.available("gpu"), Some(1));
    }
}
