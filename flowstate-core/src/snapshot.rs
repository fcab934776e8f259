//! Point-in-time copies of the run store.
//!
//! A snapshot holds every run with its history and every concurrency pool,
//! together with the log offset it covers. Opening the store loads the
//! latest snapshot and replays only the records after that offset, which is
//! what lets older log segments be deleted.

use crate::error::CoreError;
use crate::run::Run;
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const META_FILENAME: &str = "snapshot.meta.json";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// A run and its committed history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub history: Vec<State>,
}

/// One tag's limit and the runs holding its slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPoolSnapshot {
    pub tag: String,
    pub limit: u32,
    pub holders: Vec<Uuid>,
}

/// Everything the store holds at one log position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub snapshot_id: String,
    /// Log offset just past the last record reflected here.
    pub wal_offset: u64,
    pub next_sequence: u64,
    pub created_at: i64,
    pub runs: Vec<RunSnapshot>,
    pub slots: Vec<SlotPoolSnapshot>,
}

/// Describes the latest snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub file: String,
    pub wal_offset: u64,
    pub created_at: i64,
    pub runs: usize,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Directory of store snapshots. Only the latest one is kept.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>, CoreError> {
        match fs::read(self.dir.join(META_FILENAME)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a snapshot and makes it the latest.
    ///
    /// The snapshot file is synced before the metadata is swapped in by
    /// rename, so a crash leaves either the old or the new snapshot current.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<SnapshotMeta, CoreError> {
        let data = serde_json::to_vec(snapshot)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));
        let file = format!("{}{}{}", SNAPSHOT_PREFIX, snapshot.snapshot_id, SNAPSHOT_SUFFIX);
        write_synced(&self.dir.join(&file), &data)?;

        let meta = SnapshotMeta {
            snapshot_id: snapshot.snapshot_id.clone(),
            file,
            wal_offset: snapshot.wal_offset,
            created_at: snapshot.created_at,
            runs: snapshot.runs.len(),
            size_bytes: data.len() as u64,
            checksum,
        };

        let tmp = self.dir.join(format!("{}.tmp", META_FILENAME));
        write_synced(&tmp, &serde_json::to_vec_pretty(&meta)?)?;
        fs::rename(&tmp, self.dir.join(META_FILENAME))?;
        sync_dir(&self.dir)?;

        let removed = self.remove_stale(&meta.file)?;
        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            wal_offset = meta.wal_offset,
            runs = meta.runs,
            bytes = meta.size_bytes,
            removed,
            "Wrote store snapshot"
        );
        Ok(meta)
    }

    /// Loads the latest snapshot, verifying its checksum.
    pub fn load_latest(&self) -> Result<Option<StoreSnapshot>, CoreError> {
        let Some(meta) = self.latest_meta()? else {
            return Ok(None);
        };

        let data = match fs::read(self.dir.join(&meta.file)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CoreError::CorruptSnapshot {
                    reason: format!("snapshot file {} is missing", meta.file),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let actual = format!("{:08x}", crc32c::crc32c(&data));
        if actual != meta.checksum {
            return Err(CoreError::CorruptSnapshot {
                reason: format!(
                    "snapshot {} checksum mismatch (expected {}, got {})",
                    meta.snapshot_id, meta.checksum, actual
                ),
            });
        }

        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn remove_stale(&self, keep: &str) -> Result<usize, CoreError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name != keep
                && name.starts_with(SNAPSHOT_PREFIX)
                && name.ends_with(SNAPSHOT_SUFFIX);
            if stale {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
