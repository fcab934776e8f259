//! Units of work against the run store.

use crate::coordinator::RunLockGuard;
use crate::error::CoreError;
use crate::run::Run;
use crate::slots::{SlotAcquire, SlotLedger};
use crate::state::State;
use crate::store::RunStore;
use flowstate_wal::{WalEntry, WalOffset};
use parking_lot::RwLockReadGuard;
use uuid::Uuid;

/// A durably committed state write.
#[derive(Debug, Clone)]
pub struct Committed {
    pub state: State,
    pub sequence: u64,
    pub offset: WalOffset,
}

type CommitCallback = Box<dyn FnOnce(&Committed) + Send>;

/// Exclusive unit of work on one run.
///
/// Holds the run's lock table entry for its whole lifetime, and keeps
/// checkpoints from snapshotting its uncommitted slot reservations. At most one
/// state may be staged. [`commit`](Self::commit) writes the staged state, the
/// run's updated pointer and counters, and the slot changes as a single log
/// record. Dropping an uncommitted transaction rolls it back.
pub struct Transaction<'s> {
    store: &'s RunStore,
    _guard: RunLockGuard<'s>,
    _gate: RwLockReadGuard<'s, ()>,
    run: Run,
    initial_state: Option<State>,
    staged: Option<State>,
    ledger: SlotLedger,
    on_commit: Vec<CommitCallback>,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(
        store: &'s RunStore,
        guard: RunLockGuard<'s>,
        gate: RwLockReadGuard<'s, ()>,
        run: Run,
        initial_state: Option<State>,
    ) -> Self {
        Self {
            store,
            _guard: guard,
            _gate: gate,
            run,
            initial_state,
            staged: None,
            ledger: SlotLedger::default(),
            on_commit: Vec::new(),
            finished: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Working copy of the run; changes are written on commit.
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    /// The run's current state when the transaction began.
    pub fn initial_state(&self) -> Option<&State> {
        self.initial_state.as_ref()
    }

    pub fn staged(&self) -> Option<&State> {
        self.staged.as_ref()
    }

    /// Stages the run's next state and moves the run's pointer to it.
    pub fn stage(&mut self, state: State) -> Result<(), CoreError> {
        if self.staged.is_some() {
            return Err(CoreError::StateAlreadyStaged {
                run_id: self.run.id,
            });
        }
        self.run.point_to(&state);
        self.staged = Some(state);
        Ok(())
    }

    /// Reserves a slot for `tag`. The reservation is undone unless the
    /// transaction commits.
    pub fn acquire_slot(&mut self, tag: &str) -> SlotAcquire {
        if self.ledger.releases(tag) {
            return SlotAcquire::AlreadyHeld;
        }
        let outcome = self.store.slots().try_acquire(tag, self.run.id);
        if outcome == SlotAcquire::Acquired {
            self.ledger.record_acquire(tag);
        }
        outcome
    }

    /// Releases the run's slot for `tag` on commit.
    pub fn release_slot(&mut self, tag: &str) {
        if self.store.slots().holds(tag, &self.run.id) {
            self.ledger
                .record_release(self.store.slots(), tag, &self.run.id);
        }
    }

    /// Tags for which the run holds a slot, counting this transaction's
    /// reservations and ignoring its pending releases.
    pub fn held_slots(&self) -> Vec<String> {
        self.store
            .slots()
            .held_by(&self.run.id)
            .into_iter()
            .filter(|tag| !self.ledger.releases(tag))
            .collect()
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    /// Registers a callback fired after a successful commit, once the run
    /// has been released. Never fired on rollback.
    pub fn on_commit(&mut self, callback: impl FnOnce(&Committed) + Send + 'static) {
        self.on_commit.push(Box::new(callback));
    }

    /// Commits the staged state. Returns `None` if nothing was staged, in
    /// which case the transaction is rolled back.
    pub fn commit(mut self) -> Result<Option<Committed>, CoreError> {
        let Some(state) = self.staged.take() else {
            self.rollback();
            return Ok(None);
        };

        let run_id = self.run.id;
        let entry = WalEntry::CommitTransition {
            run_id: run_id.to_string(),
            state: serde_json::to_value(&state)?,
            run: serde_json::to_value(&self.run)?,
            slots: self.ledger.changes(&run_id),
        };

        let (sequence, offset) = match self.store.wal().append(&entry) {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "Commit failed, rolling back");
                return Err(e.into());
            }
        };

        self.store.apply_commit(&self.run, &state);
        std::mem::take(&mut self.ledger).commit(self.store.slots(), &run_id);
        self.finished = true;

        let callbacks = std::mem::take(&mut self.on_commit);
        let committed = Committed {
            state,
            sequence,
            offset,
        };

        drop(self);
        for callback in callbacks {
            callback(&committed);
        }

        Ok(Some(committed))
    }

    /// Abandons the transaction, undoing slot reservations.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.ledger.is_empty() {
            tracing::debug!(run_id = %self.run.id, "Undoing slot reservations");
        }
        self.ledger.rollback(self.store.slots(), &self.run.id);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.undo();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::StateKind;
    use crate::run::NewRun;
    use chrono::Utc;
    use flowstate_wal::{FsyncPolicy, WalConfig};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, RunStore) {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::new(dir.path())
            .with_segment_size(4096)
            .with_fsync_policy(FsyncPolicy::EveryWrite);
        let store = RunStore::open(config).unwrap();
        (dir, store)
    }

    fn state_for(run_id: Uuid, kind: StateKind) -> State {
        State {
            id: Uuid::new_v4(),
            run_id,
            kind,
            message: None,
            data: Value::Null,
            scheduled_time: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_commit_writes_state_and_pointer() {
        let (_dir, store) = test_store();
        let run = store.create_run(NewRun::new("r")).unwrap();

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        assert!(txn.initial_state().is_none());
        let state = state_for(run.id, StateKind::Scheduled);
        txn.stage(state.clone()).unwrap();
        let committed = txn.commit().unwrap().unwrap();

        assert_eq!(committed.state, state);
        assert_eq!(store.current_state(run.id).unwrap(), Some(state.clone()));
        assert_eq!(store.get_run(run.id).unwrap().state_id, Some(state.id));
        assert!(!store.locks().is_held(&run.id));
    }

    #[test]
    fn test_second_stage_is_refused() {
        let (_dir, store) = test_store();
        let run = store.create_run(NewRun::new("r")).unwrap();

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        txn.stage(state_for(run.id, StateKind::Scheduled)).unwrap();
        let err = txn
            .stage(state_for(run.id, StateKind::Pending))
            .unwrap_err();
        assert!(matches!(err, CoreError::StateAlreadyStaged { .. }));
    }

    #[test]
    fn test_drop_rolls_back_reservations() {
        let (_dir, store) = test_store();
        store.set_concurrency_limit("db", 1).unwrap();
        let run = store.create_run(NewRun::new("r").with_tag("db")).unwrap();

        {
            let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
            assert_eq!(txn.acquire_slot("db"), SlotAcquire::Acquired);
            assert_eq!(store.available_slots("db"), Some(0));
            txn.stage(state_for(run.id, StateKind::Running)).unwrap();
        }

        assert_eq!(store.available_slots("db"), Some(1));
        assert!(store.current_state(run.id).unwrap().is_none());
        assert!(!store.locks().is_held(&run.id));
    }

    #[test]
    fn test_release_applies_only_on_commit() {
        let (_dir, store) = test_store();
        store.set_concurrency_limit("db", 1).unwrap();
        let run = store.create_run(NewRun::new("r").with_tag("db")).unwrap();

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        txn.acquire_slot("db");
        txn.stage(state_for(run.id, StateKind::Running)).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        txn.release_slot("db");
        assert!(txn.held_slots().is_empty());
        assert_eq!(store.available_slots("db"), Some(0));
        txn.stage(state_for(run.id, StateKind::Completed)).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.available_slots("db"), Some(1));
    }

    #[test]
    fn test_callbacks_fire_after_commit_only() {
        let (_dir, store) = test_store();
        let run = store.create_run(NewRun::new("r")).unwrap();
        let fired = Arc::new(AtomicBool::new(false));

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        let flag = fired.clone();
        txn.on_commit(move |_| flag.store(true, Ordering::SeqCst));
        txn.rollback();
        assert!(!fired.load(Ordering::SeqCst));

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        let flag = fired.clone();
        txn.on_commit(move |committed| {
            assert_eq!(committed.state.kind, StateKind::Scheduled);
            flag.store(true, Ordering::SeqCst);
        });
        txn.stage(state_for(run.id, StateKind::Scheduled)).unwrap();
        txn.commit().unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert!(!store.locks().is_held(&run.id));
    }

    #[test]
    fn test_commit_without_stage_is_empty() {
        let (_dir, store) = test_store();
        let run = store.create_run(NewRun::new("r")).unwrap();

        let txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        assert!(txn.commit().unwrap().is_none());
        assert!(store.list_history(run.id).unwrap().is_empty());
    }

    #[test]
    fn test_failed_commit_leaves_store_untouched() {
        let (_dir, store) = test_store();
        store.set_concurrency_limit("db", 1).unwrap();
        let run = store.create_run(NewRun::new("r").with_tag("db")).unwrap();

        let mut txn = store.begin(run.id, Duration::from_secs(1)).unwrap();
        txn.acquire_slot("db");
        txn.stage(state_for(run.id, StateKind::Running)).unwrap();
        store.wal().close().unwrap();

        let err = txn.commit().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.available_slots("db"), Some(1));
        assert!(store.current_state(run.id).unwrap().is_none());
        assert!(!store.locks().is_held(&run.id));
    }
}
