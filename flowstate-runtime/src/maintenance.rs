//! Background WAL maintenance.
//!
//! Syncs the log on a fixed interval, which bounds the durability window of
//! the `every_ms` and `never` fsync policies, and periodically checkpoints
//! the store: a snapshot is written and the log segments it covers are
//! deleted.

use crate::broadcast::EventBroadcaster;
use crate::config::MaintenanceConfig;
use flowstate_core::{CheckpointReport, RunStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;

/// Periodic sync and checkpoint task.
pub struct MaintenanceTask {
    store: Arc<RunStore>,
    events: Option<Arc<EventBroadcaster>>,
    config: MaintenanceConfig,
    syncs: AtomicU64,
    checkpoints: AtomicU64,
    failures: AtomicU64,
    last_checkpoint: Mutex<Instant>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl MaintenanceTask {
    pub fn new(
        store: Arc<RunStore>,
        events: Option<Arc<EventBroadcaster>>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
            syncs: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_checkpoint: Mutex::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn checkpoint_due(&self) -> bool {
        match self.config.checkpoint_interval() {
            Some(interval) => self.last_checkpoint.lock().elapsed() >= interval,
            None => false,
        }
    }

    /// Runs one maintenance pass.
    pub fn run_once(&self) -> MaintenanceResult {
        let mut result = MaintenanceResult::default();

        match self.store.sync() {
            Ok(()) => {
                self.syncs.fetch_add(1, Ordering::Relaxed);
                result.synced = true;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "WAL sync failed");
            }
        }

        if self.checkpoint_due() {
            match self.store.checkpoint() {
                Ok(report) => {
                    self.checkpoints.fetch_add(1, Ordering::Relaxed);
                    *self.last_checkpoint.lock() = Instant::now();
                    tracing::debug!(
                        snapshot_id = %report.snapshot_id,
                        segments_compacted = report.segments_compacted,
                        "Checkpoint written"
                    );
                    result.checkpoint = Some(report);
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Checkpoint failed");
                }
            }
        }

        if let Some(events) = &self.events {
            result.channels_pruned = events.prune();
        }

        result
    }

    /// Runs the maintenance loop (call from a background task).
    pub async fn run(&self) {
        if !self.config.enabled {
            tracing::info!("Background maintenance is disabled");
            return;
        }

        tracing::info!(
            "Maintenance task started (sync_interval_ms={}, checkpoint_interval_secs={})",
            self.config.sync_interval_ms,
            self.config.checkpoint_interval_secs
        );

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.sync_interval()) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.run_once();
        }

        tracing::info!("Maintenance task stopped");
    }

    /// Signals the loop to stop after its current pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> MaintenanceStats {
        MaintenanceStats {
            syncs: self.syncs.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            since_checkpoint: self.last_checkpoint.lock().elapsed(),
        }
    }
}

/// Result of one maintenance pass.
#[derive(Debug, Default)]
pub struct MaintenanceResult {
    pub synced: bool,
    /// The checkpoint taken on this pass, if one was due.
    pub checkpoint: Option<CheckpointReport>,
    pub channels_pruned: usize,
}

/// Maintenance statistics.
#[derive(Debug)]
pub struct MaintenanceStats {
    pub syncs: u64,
    pub checkpoints: u64,
    pub failures: u64,
    pub since_checkpoint: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstate_core::NewRun;
    use flowstate_wal::{FsyncPolicy, WalConfig, WalEntry};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn store(dir: &TempDir) -> Arc<RunStore> {
        let config = WalConfig::new(dir.path()).with_fsync_policy(FsyncPolicy::Never);
        Arc::new(RunStore::open(config).unwrap())
    }

    fn config(checkpoint_interval_secs: u64) -> MaintenanceConfig {
        MaintenanceConfig {
            enabled: true,
            sync_interval_ms: 10,
            checkpoint_interval_secs,
        }
    }

    #[test]
    fn test_run_once_syncs_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = MaintenanceTask::new(store.clone(), None, config(1));
        store.create_run(NewRun::new("r")).unwrap();

        let result = task.run_once();
        assert!(result.synced);
        assert!(result.checkpoint.is_none());

        *task.last_checkpoint.lock() = Instant::now() - Duration::from_secs(2);
        let result = task.run_once();
        let report = result.checkpoint.unwrap();
        assert_eq!(report.runs, 1);

        let entries = store.wal().read_from(report.wal_offset, None).unwrap();
        assert!(matches!(entries[0].2, WalEntry::Checkpoint { .. }));
        let meta = store.snapshots().latest_meta().unwrap().unwrap();
        assert_eq!(meta.snapshot_id, report.snapshot_id);

        let stats = task.stats();
        assert_eq!(stats.syncs, 2);
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_failures_are_counted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let task = MaintenanceTask::new(store.clone(), None, config(1));
        *task.last_checkpoint.lock() = Instant::now() - Duration::from_secs(2);

        store.wal().close().unwrap();
        let result = task.run_once();
        assert!(result.checkpoint.is_none());
        assert!(task.stats().failures >= 1);
    }

    #[test]
    fn test_prunes_idle_channels() {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(EventBroadcaster::new(8));
        let (_, stream) = events.subscribe_run(Uuid::new_v4());
        drop(stream);

        let task = MaintenanceTask::new(store(&dir), Some(events.clone()), config(0));
        assert_eq!(task.run_once().channels_pruned, 1);
        assert_eq!(events.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let task = Arc::new(MaintenanceTask::new(store(&dir), None, config(0)));

        let handle = tokio::spawn({
            let task = task.clone();
            async move { task.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(task.stats().syncs >= 1);
    }

    #[tokio::test]
    async fn test_disabled_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let mut disabled = config(0);
        disabled.enabled = false;
        let task = MaintenanceTask::new(store(&dir), None, disabled);
        task.run().await;
        assert_eq!(task.stats().syncs, 0);
    }
}
