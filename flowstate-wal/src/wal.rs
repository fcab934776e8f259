//! Write-ahead log.

use crate::entry::{WalEntry, WalRecord};
use crate::error::WalError;
use crate::recovery::repair_wal;
use crate::segment::{list_segments, Segment, SegmentId};
use crate::DEFAULT_SEGMENT_SIZE;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock file held for as long as a [`Wal`] is open on a directory.
pub const LOCK_FILENAME: &str = "LOCK";

/// When appended records are flushed to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    #[default]
    EveryWrite,
    /// Fsync after N appends.
    EveryN(u32),
    /// Fsync on the first append after N milliseconds have passed since the
    /// last sync. A periodic [`Wal::sync`] bounds the window when idle.
    EveryMs(u32),
    /// Only on explicit [`Wal::sync`].
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub dir: PathBuf,
    /// Segment size that triggers rotation.
    pub segment_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// Position of a record: segment id in the high 24 bits, byte offset within
/// the segment in the low 40.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalOffset(u64);

impl WalOffset {
    const OFFSET_BITS: u64 = 40;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    pub fn new(segment_id: SegmentId, offset: u64) -> Self {
        Self((segment_id << Self::OFFSET_BITS) | (offset & Self::OFFSET_MASK))
    }

    /// Offset of the first record the log can hold.
    pub fn start() -> Self {
        Self::new(0, 0)
    }

    pub fn segment_id(&self) -> SegmentId {
        self.0 >> Self::OFFSET_BITS
    }

    pub fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

/// I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub bytes_written: u64,
    pub writes: u64,
    pub reads: u64,
    pub fsyncs: u64,
}

struct Writer {
    segment: Segment,
    writes_since_sync: u64,
    last_sync: Instant,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    sync: AtomicBool,
    truncate: AtomicBool,
}

/// Segmented write-ahead log.
///
/// Appends are serialized by an internal mutex; reads open segment files
/// independently and never block writers for longer than the segment list
/// snapshot. The directory is locked exclusively while the log is open.
pub struct Wal {
    config: WalConfig,
    writer: Mutex<Writer>,
    segments: Mutex<Vec<SegmentId>>,
    next_sequence: AtomicU64,
    closed: AtomicBool,
    poisoned: AtomicBool,
    bytes_written: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
    fsyncs: AtomicU64,
    _lock: File,
    #[cfg(test)]
    faults: Faults,
}

fn lock_dir(config: &WalConfig) -> Result<File, WalError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(config.dir.join(LOCK_FILENAME))?;

    if let Err(e) = file.try_lock_exclusive() {
        if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
            return Err(WalError::Locked {
                dir: config.dir.clone(),
            });
        }
        return Err(e.into());
    }
    Ok(file)
}

impl Wal {
    /// Opens the log, creating the directory and first segment if needed.
    ///
    /// Damaged segment tails are truncated before the log accepts appends.
    /// Fails with [`WalError::Locked`] if another log holds the directory.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = lock_dir(&config)?;

        let report = repair_wal(&config.dir, config.segment_size)?;
        if let Some((id, reason)) = report.segments_with_errors.first() {
            return Err(WalError::InvalidHeader {
                offset: WalOffset::new(*id, 0).as_u64(),
                reason: format!("unreadable segment {}: {}", id, reason),
            });
        }

        let mut segment_ids = list_segments(&config.dir)?;
        let segment = match segment_ids.last() {
            Some(&id) => Segment::open(&config.dir, id, config.segment_size)?,
            None => {
                let segment = Segment::create(&config.dir, 1, config.segment_size)?;
                segment_ids.push(1);
                segment
            }
        };

        tracing::info!(
            segments = segment_ids.len(),
            records = report.valid_records,
            truncated_bytes = report.bytes_truncated,
            next_sequence = report.max_sequence + 1,
            "WAL opened"
        );

        Ok(Self {
            writer: Mutex::new(Writer {
                segment,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
            segments: Mutex::new(segment_ids),
            next_sequence: AtomicU64::new(report.max_sequence + 1),
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            fsyncs: AtomicU64::new(0),
            _lock: lock,
            #[cfg(test)]
            faults: Faults::default(),
            config,
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Appends an entry, returning its sequence number and offset.
    ///
    /// The record is durable on return under [`FsyncPolicy::EveryWrite`].
    /// On error the record is not in the log: a write or sync that fails is
    /// truncated away, and if that truncation fails too the log is poisoned
    /// and every later append fails with [`WalError::Poisoned`].
    pub fn append(&self, entry: &WalEntry) -> Result<(u64, WalOffset), WalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }

        let mut writer = self.writer.lock();
        if self.poisoned.load(Ordering::Acquire) {
            return Err(WalError::Poisoned);
        }

        // Sequence is assigned under the writer lock so it follows file order.
        let sequence = self.next_sequence.load(Ordering::SeqCst);
        let record = WalRecord::from_entry(entry, sequence)?;
        let record_size = record.disk_size();

        if !writer.segment.can_fit(record_size) {
            self.rotate(&mut writer)?;
        }

        let segment_id = writer.segment.id();
        let offset = writer.segment.size();
        if let Err(e) = self.write_record(&mut writer, &record) {
            return Err(self.discard_tail(&mut writer, offset, sequence, e));
        }

        self.next_sequence.store(sequence + 1, Ordering::SeqCst);
        self.bytes_written
            .fetch_add(record_size as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok((sequence, WalOffset::new(segment_id, offset)))
    }

    fn write_record(&self, writer: &mut Writer, record: &WalRecord) -> Result<(), WalError> {
        writer.segment.append(record)?;
        writer.writes_since_sync += 1;

        let due = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => writer.writes_since_sync >= u64::from(n.max(1)),
            FsyncPolicy::EveryMs(ms) => {
                writer.last_sync.elapsed() >= Duration::from_millis(u64::from(ms))
            }
            FsyncPolicy::Never => false,
        };
        if due {
            self.sync_writer(writer)?;
        }
        Ok(())
    }

    /// Cuts the segment back to `offset` after a failed append.
    fn discard_tail(
        &self,
        writer: &mut Writer,
        offset: u64,
        sequence: u64,
        cause: WalError,
    ) -> WalError {
        match self.truncate_writer(writer, offset) {
            Ok(()) => {
                tracing::warn!(
                    segment = writer.segment.id(),
                    offset,
                    sequence,
                    error = %cause,
                    "Append failed, record discarded"
                );
                cause
            }
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(
                    segment = writer.segment.id(),
                    offset,
                    sequence,
                    error = %cause,
                    truncate_error = %e,
                    "Append failed and could not be discarded; WAL poisoned"
                );
                WalError::Indeterminate {
                    sequence,
                    reason: format!("{}; discarding the record failed: {}", cause, e),
                }
            }
        }
    }

    fn truncate_writer(&self, writer: &mut Writer, offset: u64) -> Result<(), WalError> {
        #[cfg(test)]
        if self.faults.truncate.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected truncate failure").into());
        }

        writer.segment.truncate_at(offset)?;
        writer.writes_since_sync = 0;
        writer.last_sync = Instant::now();
        Ok(())
    }

    fn rotate(&self, writer: &mut Writer) -> Result<(), WalError> {
        self.sync_writer(writer)?;

        let next_id = writer.segment.id() + 1;
        writer.segment = Segment::create(&self.config.dir, next_id, self.config.segment_size)?;
        self.segments.lock().push(next_id);

        tracing::debug!(segment = next_id, "Rotated WAL segment");
        Ok(())
    }

    fn sync_writer(&self, writer: &mut Writer) -> Result<(), WalError> {
        #[cfg(test)]
        if self.faults.sync.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected fsync failure").into());
        }

        writer.segment.sync()?;
        writer.writes_since_sync = 0;
        writer.last_sync = Instant::now();
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes pending appends to disk.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut writer = self.writer.lock();
        self.sync_writer(&mut writer)
    }

    /// Reads entries at or after `from`, in log order.
    pub fn read_from(
        &self,
        from: WalOffset,
        limit: Option<usize>,
    ) -> Result<Vec<(u64, WalOffset, WalEntry)>, WalError> {
        let segment_ids: Vec<SegmentId> = self
            .segments
            .lock()
            .iter()
            .copied()
            .filter(|&id| id >= from.segment_id())
            .collect();
        let mut remaining = limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();

        for id in segment_ids {
            if remaining == 0 {
                break;
            }

            let mut segment = Segment::open(&self.config.dir, id, self.config.segment_size)?;
            for (offset, record) in segment.read_records()? {
                let position = WalOffset::new(id, offset);
                if position < from {
                    continue;
                }

                results.push((record.header.sequence, position, record.entry()?));
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(results)
    }

    /// Rejects further appends and syncs what was written.
    pub fn close(&self) -> Result<(), WalError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a failed append left the log in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Sequence number the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn earliest_offset(&self) -> Option<WalOffset> {
        self.segments
            .lock()
            .first()
            .map(|&id| WalOffset::new(id, 0))
    }

    /// Offset just past the last appended record.
    pub fn latest_offset(&self) -> WalOffset {
        let writer = self.writer.lock();
        WalOffset::new(writer.segment.id(), writer.segment.size())
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.lock().clone()
    }

    /// Deletes every segment that ends before `before`. The segment holding
    /// `before` and the one being written are kept.
    ///
    /// Callers must have captured everything those segments hold elsewhere.
    /// Returns the number of segments deleted.
    pub fn compact_before(&self, before: WalOffset) -> Result<usize, WalError> {
        let writer = self.writer.lock();
        let keep_from = before.segment_id().min(writer.segment.id());

        let doomed: Vec<SegmentId> = {
            let mut segments = self.segments.lock();
            let (doomed, kept): (Vec<SegmentId>, Vec<SegmentId>) =
                segments.iter().partition(|&&id| id < keep_from);
            *segments = kept;
            doomed
        };
        drop(writer);

        let mut deleted = 0;
        for id in doomed {
            let path = self.config.dir.join(crate::segment::segment_filename(id));
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(segment = id, "Compacted WAL segment");
                    deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(deleted)
    }

    /// Total bytes across all segments.
    pub fn total_size(&self) -> Result<u64, WalError> {
        let mut total = 0;
        for id in self.segment_ids() {
            let path = self.config.dir.join(crate::segment::segment_filename(id));
            total += std::fs::metadata(path)?.len();
        }
        Ok(total)
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> WalConfig {
        WalConfig::new(dir)
            .with_segment_size(4096)
            .with_fsync_policy(FsyncPolicy::EveryWrite)
    }

    fn commit(run: &str, n: u64) -> WalEntry {
        WalEntry::CommitTransition {
            run_id: run.to_string(),
            state: json!({"kind": "RUNNING", "message": format!("attempt {}", n)}),
            run: json!({"run_count": n}),
            slots: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();

        let (seq, offset) = wal.append(&commit("r-1", 1)).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(offset, WalOffset::new(1, 0));

        let entries = wal.read_from(WalOffset::start(), None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, 1);
        assert_eq!(entries[0].2.run_id(), Some("r-1"));
        assert_eq!(wal.stats().writes, 1);
        assert!(wal.stats().fsyncs >= 1);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(dir.path())).unwrap();
            for n in 0..10 {
                wal.append(&commit("r-1", n)).unwrap();
            }
            wal.close().unwrap();
        }

        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert_eq!(wal.next_sequence(), 11);
        let (seq, _) = wal.append(&commit("r-1", 10)).unwrap();
        assert_eq!(seq, 11);
        assert_eq!(wal.read_from(WalOffset::start(), None).unwrap().len(), 11);
    }

    #[test]
    fn test_segment_rotation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_segment_size(512);
        let wal = Wal::open(config).unwrap();

        for n in 0..20 {
            wal.append(&commit("r-1", n)).unwrap();
        }

        assert!(wal.segment_ids().len() > 1);
        let entries = wal.read_from(WalOffset::start(), None).unwrap();
        assert_eq!(entries.len(), 20);
        let sequences: Vec<u64> = entries.iter().map(|(seq, _, _)| *seq).collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
        assert!(wal.total_size().unwrap() > 512);
    }

    #[test]
    fn test_read_from_offset_with_limit() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();

        let mut offsets = Vec::new();
        for n in 0..5 {
            offsets.push(wal.append(&commit("r-1", n)).unwrap().1);
        }

        let entries = wal.read_from(offsets[2], Some(2)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, offsets[2]);
        assert_eq!(entries[1].1, offsets[3]);
    }

    #[test]
    fn test_closed_wal_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();
        wal.close().unwrap();

        assert!(wal.is_closed());
        let err = wal.append(&commit("r-1", 0)).unwrap_err();
        assert!(matches!(err, WalError::Closed));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_open_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(dir.path())).unwrap();
            wal.append(&commit("r-1", 0)).unwrap();
            wal.append(&commit("r-1", 1)).unwrap();
            wal.close().unwrap();
        }

        let path = dir.path().join(crate::segment::segment_filename(1));
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 5);
        std::fs::write(&path, &bytes).unwrap();

        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert_eq!(wal.read_from(WalOffset::start(), None).unwrap().len(), 1);
        assert_eq!(wal.next_sequence(), 2);

        wal.append(&commit("r-1", 2)).unwrap();
        assert_eq!(wal.read_from(WalOffset::start(), None).unwrap().len(), 2);
    }

    #[test]
    fn test_every_n_policy_batches_fsyncs() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_fsync_policy(FsyncPolicy::EveryN(3));
        let wal = Wal::open(config).unwrap();

        for n in 0..6 {
            wal.append(&commit("r-1", n)).unwrap();
        }
        assert_eq!(wal.stats().fsyncs, 2);
    }

    #[test]
    fn test_failed_sync_discards_record() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::open(test_config(dir.path())).unwrap();
            wal.append(&commit("r-1", 1)).unwrap();

            wal.faults.sync.store(true, Ordering::SeqCst);
            let err = wal.append(&commit("r-1", 2)).unwrap_err();
            assert!(matches!(err, WalError::Io(_)));
            assert!(!wal.is_poisoned());

            assert_eq!(wal.read_from(WalOffset::start(), None).unwrap().len(), 1);
            assert_eq!(wal.next_sequence(), 2);

            let (seq, _) = wal.append(&commit("r-1", 3)).unwrap();
            assert_eq!(seq, 2);
            wal.close().unwrap();
        }

        let wal = Wal::open(test_config(dir.path())).unwrap();
        let entries = wal.read_from(WalOffset::start(), None).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[1].2,
            WalEntry::CommitTransition { run, .. } if run == &json!({"run_count": 3})
        ));
    }

    #[test]
    fn test_undiscardable_append_poisons_wal() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();
        wal.append(&commit("r-1", 1)).unwrap();

        wal.faults.sync.store(true, Ordering::SeqCst);
        wal.faults.truncate.store(true, Ordering::SeqCst);
        let err = wal.append(&commit("r-1", 2)).unwrap_err();
        assert!(matches!(err, WalError::Indeterminate { sequence: 2, .. }));
        assert!(!err.is_retryable());
        assert!(wal.is_poisoned());

        assert!(matches!(
            wal.append(&commit("r-1", 3)).unwrap_err(),
            WalError::Poisoned
        ));
    }

    #[test]
    fn test_directory_is_locked_while_open() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(test_config(dir.path())).unwrap();

        let err = Wal::open(test_config(dir.path())).err().unwrap();
        assert!(matches!(err, WalError::Locked { .. }));

        drop(wal);
        let wal = Wal::open(test_config(dir.path())).unwrap();
        assert!(dir.path().join(LOCK_FILENAME).exists());
        assert!(wal.segment_ids().len() == 1);
    }

    #[test]
    fn test_compact_before() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path()).with_segment_size(256);
        let wal = Wal::open(config.clone()).unwrap();

        let mut offsets = Vec::new();
        for n in 0..30 {
            offsets.push(wal.append(&commit("r-1", n)).unwrap().1);
        }
        let segment_ids = wal.segment_ids();
        assert!(segment_ids.len() > 3);

        let keep = offsets[20];
        let deleted = wal.compact_before(keep).unwrap();
        assert_eq!(
            deleted,
            segment_ids.iter().filter(|&&id| id < keep.segment_id()).count()
        );
        assert_eq!(wal.segment_ids().first(), Some(&keep.segment_id()));

        let entries = wal.read_from(keep, None).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(wal.compact_before(keep).unwrap(), 0);
        drop(wal);

        let wal = Wal::open(config).unwrap();
        assert_eq!(wal.next_sequence(), 31);
        assert_eq!(wal.read_from(keep, None).unwrap().len(), 10);
    }

    #[test]
    fn test_offset_packing() {
        let offset = WalOffset::new(7, 1234);
        assert_eq!(offset.segment_id(), 7);
        assert_eq!(offset.offset(), 1234);
        assert!(WalOffset::new(1, 9999) < WalOffset::new(2, 0));
        assert_eq!(WalOffset::from_u64(offset.as_u64()), offset);
    }
}
