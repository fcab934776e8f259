//! Durable run store and state history.
//!
//! All mutations go through the write-ahead log first; the in-memory
//! indexes are rebuilt on open from the latest snapshot plus the log
//! records written after it.

use crate::coordinator::RunLocks;
use crate::error::CoreError;
use crate::run::{NewRun, Run};
use crate::slots::{ConcurrencySlots, SlotUsage};
use crate::snapshot::{RunSnapshot, SnapshotStore, StoreSnapshot};
use crate::state::State;
use crate::txn::Transaction;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowstate_wal::{SlotChange, Wal, WalConfig, WalEntry, WalOffset};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default wait for a run's lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot directory, inside the log directory.
pub const SNAPSHOT_DIRNAME: &str = "snapshots";

/// Outcome of [`RunStore::checkpoint`].
#[derive(Debug, Clone)]
pub struct CheckpointReport {
    pub snapshot_id: String,
    /// Log position the snapshot covers; replay starts here.
    pub wal_offset: WalOffset,
    /// Sequence of the checkpoint marker appended after the snapshot.
    pub sequence: u64,
    pub runs: usize,
    pub segments_compacted: usize,
}

/// A run and its history, updated together so readers never see a pointer
/// to a state that is missing from the history.
#[derive(Debug, Clone)]
struct RunRecord {
    run: Run,
    /// Committed states in commit order, which is also timestamp order.
    history: Vec<State>,
}

impl RunRecord {
    fn current(&self) -> Option<&State> {
        let id = self.run.state_id?;
        self.history.iter().rev().find(|state| state.id == id)
    }
}

/// WAL-backed store of runs, their states and concurrency slots.
pub struct RunStore {
    wal: Arc<Wal>,
    records: DashMap<Uuid, RunRecord>,
    /// State id to owning run id.
    state_index: DashMap<Uuid, Uuid>,
    locks: RunLocks,
    slots: ConcurrencySlots,
    snapshots: SnapshotStore,
    /// Held shared by every write (units of work included) and exclusively
    /// while a snapshot is taken.
    gate: RwLock<()>,
    lock_timeout: Duration,
}

impl RunStore {
    /// Opens the log at the configured directory and replays it.
    pub fn open(config: WalConfig) -> Result<Self, CoreError> {
        Self::with_wal(Arc::new(Wal::open(config)?))
    }

    /// Builds the store over an already open log.
    pub fn with_wal(wal: Arc<Wal>) -> Result<Self, CoreError> {
        let snapshots = SnapshotStore::open(wal.config().dir.join(SNAPSHOT_DIRNAME))?;
        let store = Self {
            wal,
            records: DashMap::new(),
            state_index: DashMap::new(),
            locks: RunLocks::new(),
            slots: ConcurrencySlots::new(),
            snapshots,
            gate: RwLock::new(()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        store.replay()?;
        Ok(store)
    }

    /// Sets the wait used by administrative operations that lock a run.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn replay(&self) -> Result<(), CoreError> {
        let start = match self.snapshots.load_latest()? {
            Some(snapshot) => {
                let start = WalOffset::from_u64(snapshot.wal_offset);
                tracing::info!(
                    snapshot_id = %snapshot.snapshot_id,
                    runs = snapshot.runs.len(),
                    wal_offset = snapshot.wal_offset,
                    "Loaded store snapshot"
                );
                self.restore(snapshot);
                start
            }
            None => WalOffset::start(),
        };

        if self.wal.latest_offset() < start {
            return Err(CoreError::CorruptSnapshot {
                reason: format!(
                    "log ends at {:?}, before the snapshot offset {:?}",
                    self.wal.latest_offset(),
                    start
                ),
            });
        }
        if start == WalOffset::start() {
            if let Some(first) = self.wal.earliest_offset().filter(|o| o.segment_id() > 1) {
                return Err(CoreError::CorruptSnapshot {
                    reason: format!(
                        "log starts at segment {} but no snapshot covers the earlier ones",
                        first.segment_id()
                    ),
                });
            }
        }

        let entries = self.wal.read_from(start, None)?;
        let entry_count = entries.len();

        for (sequence, _offset, entry) in entries {
            self.replay_entry(sequence, entry)?;
        }

        if entry_count > 0 {
            tracing::info!(
                entries = entry_count,
                runs = self.records.len(),
                states = self.state_index.len(),
                "Run store replay complete"
            );
        }

        Ok(())
    }

    fn restore(&self, snapshot: StoreSnapshot) {
        for RunSnapshot { run, history } in snapshot.runs {
            for state in &history {
                self.state_index.insert(state.id, run.id);
            }
            self.records.insert(run.id, RunRecord { run, history });
        }
        self.slots.restore(snapshot.slots);
    }

    fn replay_entry(&self, sequence: u64, entry: WalEntry) -> Result<(), CoreError> {
        match entry {
            WalEntry::CreateRun { run, .. } => {
                let run: Run = serde_json::from_value(run)?;
                self.records.entry(run.id).or_insert(RunRecord {
                    run,
                    history: Vec::new(),
                });
            }

            WalEntry::CommitTransition {
                run_id,
                state,
                run,
                slots,
            } => {
                let state: State = serde_json::from_value(state)?;
                let run: Run = serde_json::from_value(run)?;
                if !self.records.contains_key(&run.id) {
                    tracing::warn!(sequence, %run_id, "Skipping commit for unknown run");
                    return Ok(());
                }
                self.apply_commit(&run, &state);
                for change in &slots {
                    self.slots.apply(change);
                }
            }

            WalEntry::DeleteState { run_id, state_id } => {
                if let (Ok(run_id), Ok(state_id)) =
                    (Uuid::parse_str(&run_id), Uuid::parse_str(&state_id))
                {
                    self.remove_state(run_id, state_id);
                }
            }

            WalEntry::DeleteRun { run_id, slots } => {
                if let Ok(run_id) = Uuid::parse_str(&run_id) {
                    self.remove_run(&run_id);
                }
                for change in &slots {
                    self.slots.apply(change);
                }
            }

            WalEntry::SetConcurrencyLimit { tag, limit } => match limit {
                Some(limit) => self.slots.set_limit(&tag, limit),
                None => {
                    self.slots.remove_limit(&tag);
                }
            },

            WalEntry::Checkpoint { .. } => {}
        }

        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Creates a run with no state.
    pub fn create_run(&self, new: NewRun) -> Result<Run, CoreError> {
        let run = Run::new(new);
        let _gate = self.write_gate();

        match self.records.entry(run.id) {
            Entry::Occupied(_) => Err(CoreError::RunExists { run_id: run.id }),
            Entry::Vacant(vacant) => {
                let entry = WalEntry::CreateRun {
                    run_id: run.id.to_string(),
                    run: serde_json::to_value(&run)?,
                };
                self.wal.append(&entry)?;

                vacant.insert(RunRecord {
                    run: run.clone(),
                    history: Vec::new(),
                });
                tracing::debug!(run_id = %run.id, name = %run.name, "Created run");
                Ok(run)
            }
        }
    }

    pub fn get_run(&self, run_id: Uuid) -> Result<Run, CoreError> {
        self.records
            .get(&run_id)
            .map(|record| record.run.clone())
            .ok_or(CoreError::RunNotFound { run_id })
    }

    pub fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .records
            .iter()
            .map(|record| record.run.clone())
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub fn run_count(&self) -> usize {
        self.records.len()
    }

    /// Deletes a run together with its whole history, releasing any slots
    /// it holds.
    pub fn delete_run(&self, run_id: Uuid) -> Result<(), CoreError> {
        let _guard = self.locks.acquire(run_id, self.lock_timeout)?;
        let _gate = self.write_gate();
        if !self.records.contains_key(&run_id) {
            return Err(CoreError::RunNotFound { run_id });
        }

        let slots: Vec<SlotChange> = self
            .slots
            .held_by(&run_id)
            .into_iter()
            .map(|tag| SlotChange::Release {
                tag,
                run_id: run_id.to_string(),
            })
            .collect();

        self.wal.append(&WalEntry::DeleteRun {
            run_id: run_id.to_string(),
            slots: slots.clone(),
        })?;

        self.remove_run(&run_id);
        for change in &slots {
            self.slots.apply(change);
        }

        tracing::debug!(%run_id, released_slots = slots.len(), "Deleted run");
        Ok(())
    }

    fn remove_run(&self, run_id: &Uuid) {
        if let Some((_, record)) = self.records.remove(run_id) {
            for state in &record.history {
                self.state_index.remove(&state.id);
            }
        }
    }

    // =========================================================================
    // States
    // =========================================================================

    pub fn current_state(&self, run_id: Uuid) -> Result<Option<State>, CoreError> {
        self.records
            .get(&run_id)
            .map(|record| record.current().cloned())
            .ok_or(CoreError::RunNotFound { run_id })
    }

    /// Every committed state of the run, oldest first.
    pub fn list_history(&self, run_id: Uuid) -> Result<Vec<State>, CoreError> {
        self.records
            .get(&run_id)
            .map(|record| record.history.clone())
            .ok_or(CoreError::RunNotFound { run_id })
    }

    pub fn read_state(&self, state_id: Uuid) -> Option<State> {
        let run_id = *self.state_index.get(&state_id)?;
        let record = self.records.get(&run_id)?;
        record
            .history
            .iter()
            .find(|state| state.id == state_id)
            .cloned()
    }

    /// Removes a superseded state from history. Administrative only.
    ///
    /// Returns `false` if the state does not exist. A run's current state
    /// cannot be deleted.
    pub fn delete_state(&self, state_id: Uuid) -> Result<bool, CoreError> {
        let Some(run_id) = self.state_index.get(&state_id).map(|r| *r) else {
            return Ok(false);
        };

        let _guard = self.locks.acquire(run_id, self.lock_timeout)?;
        let _gate = self.write_gate();
        {
            let Some(record) = self.records.get(&run_id) else {
                return Ok(false);
            };
            if record.run.state_id == Some(state_id) {
                return Err(CoreError::CurrentStateDeletion { state_id, run_id });
            }
            if !record.history.iter().any(|state| state.id == state_id) {
                return Ok(false);
            }
        }

        self.wal.append(&WalEntry::DeleteState {
            run_id: run_id.to_string(),
            state_id: state_id.to_string(),
        })?;
        self.remove_state(run_id, state_id);
        Ok(true)
    }

    fn remove_state(&self, run_id: Uuid, state_id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&run_id) {
            record.history.retain(|state| state.id != state_id);
        }
        self.state_index.remove(&state_id);
    }

    // =========================================================================
    // Units of work
    // =========================================================================

    /// Begins a unit of work on a run, waiting up to `timeout` for the run's
    /// lock.
    pub fn begin(&self, run_id: Uuid, timeout: Duration) -> Result<Transaction<'_>, CoreError> {
        let guard = self.locks.acquire(run_id, timeout)?;
        let gate = self.write_gate();
        let (run, initial_state) = {
            let record = self
                .records
                .get(&run_id)
                .ok_or(CoreError::RunNotFound { run_id })?;
            (record.run.clone(), record.current().cloned())
        };

        Ok(Transaction::new(self, guard, gate, run, initial_state))
    }

    /// Shared hold on the store for one write. Recursive so a thread that
    /// already holds it never queues behind a waiting checkpoint.
    pub(crate) fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read_recursive()
    }

    pub(crate) fn apply_commit(&self, run: &Run, state: &State) {
        if let Some(mut record) = self.records.get_mut(&run.id) {
            record.run = run.clone();
            record.history.push(state.clone());
        }
        self.state_index.insert(state.id, run.id);
    }

    // =========================================================================
    // Concurrency limits
    // =========================================================================

    pub fn set_concurrency_limit(&self, tag: &str, limit: u32) -> Result<(), CoreError> {
        let _gate = self.write_gate();
        self.wal.append(&WalEntry::SetConcurrencyLimit {
            tag: tag.to_string(),
            limit: Some(limit),
        })?;
        self.slots.set_limit(tag, limit);
        tracing::info!(tag, limit, "Set concurrency limit");
        Ok(())
    }

    pub fn remove_concurrency_limit(&self, tag: &str) -> Result<bool, CoreError> {
        let _gate = self.write_gate();
        if self.slots.limit(tag).is_none() {
            return Ok(false);
        }
        self.wal.append(&WalEntry::SetConcurrencyLimit {
            tag: tag.to_string(),
            limit: None,
        })?;
        Ok(self.slots.remove_limit(tag))
    }

    /// Free slots for a tag, or `None` if it has no limit.
    pub fn available_slots(&self, tag: &str) -> Option<u32> {
        self.slots.available(tag)
    }

    pub fn slot_holders(&self, tag: &str) -> Vec<Uuid> {
        self.slots.holders(tag)
    }

    pub fn slot_usage(&self) -> Vec<SlotUsage> {
        self.slots.usage()
    }

    // =========================================================================
    // Log access
    // =========================================================================

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    pub(crate) fn slots(&self) -> &ConcurrencySlots {
        &self.slots
    }

    pub fn sync(&self) -> Result<(), CoreError> {
        self.wal.sync()?;
        Ok(())
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Snapshots the whole store, then deletes the log segments the
    /// snapshot covers.
    ///
    /// Waits for open transactions to finish and holds new ones back while
    /// the in-memory state is copied. Must not be called by a thread that
    /// holds an open transaction.
    pub fn checkpoint(&self) -> Result<CheckpointReport, CoreError> {
        let snapshot = {
            let _gate = self.gate.write();
            self.wal.sync()?;
            let wal_offset = self.wal.latest_offset();
            let next_sequence = self.wal.next_sequence();

            let mut runs: Vec<RunSnapshot> = self
                .records
                .iter()
                .map(|record| RunSnapshot {
                    run: record.run.clone(),
                    history: record.history.clone(),
                })
                .collect();
            runs.sort_by_key(|snapshot| snapshot.run.created_at);

            StoreSnapshot {
                snapshot_id: format!("{:016x}", next_sequence),
                wal_offset: wal_offset.as_u64(),
                next_sequence,
                created_at: Utc::now().timestamp_millis(),
                runs,
                slots: self.slots.snapshot(),
            }
        };

        let meta = self.snapshots.save(&snapshot)?;
        let (sequence, _) = self.wal.append(&WalEntry::Checkpoint {
            timestamp: snapshot.created_at,
        })?;
        self.wal.sync()?;

        let wal_offset = WalOffset::from_u64(snapshot.wal_offset);
        let segments_compacted = self.wal.compact_before(wal_offset)?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            sequence,
            runs = meta.runs,
            segments_compacted,
            "Checkpoint complete"
        );

        Ok(CheckpointReport {
            snapshot_id: meta.snapshot_id,
            wal_offset,
            sequence,
            runs: meta.runs,
            segments_compacted,
        })
    }
}
