//! Run-scoped exclusive sections.
//!
//! At most one unit of work may hold a given run at a time. Holding is
//! tracked in the store's lock table; the guard belongs to the
//! [`Transaction`](crate::Transaction), so the run is released exactly when
//! the transaction commits, rolls back or is dropped.

use crate::error::CoreError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lock table of runs currently inside a unit of work.
#[derive(Default)]
pub struct RunLocks {
    held: Mutex<HashSet<Uuid>>,
    released: Condvar,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the run, waiting at most `timeout`.
    pub fn acquire(&self, run_id: Uuid, timeout: Duration) -> Result<RunLockGuard<'_>, CoreError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock();

        while held.contains(&run_id) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(&run_id)
            {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(%run_id, waited_ms, "Run lock wait timed out");
                return Err(CoreError::ConcurrencyContention { run_id, waited_ms });
            }
        }

        held.insert(run_id);
        Ok(RunLockGuard {
            locks: self,
            run_id,
        })
    }

    pub fn is_held(&self, run_id: &Uuid) -> bool {
        self.held.lock().contains(run_id)
    }

    /// Number of runs currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, run_id: &Uuid) {
        self.held.lock().remove(run_id);
        self.released.notify_all();
    }
}

/// Proof that the current unit of work holds a run.
pub struct RunLockGuard<'a> {
    locks: &'a RunLocks,
    run_id: Uuid,
}

impl RunLockGuard<'_> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.run_id);
    }
}
