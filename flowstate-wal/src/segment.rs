//! Segment files.
//!
//! The log is a sequence of segment files named by a monotonically
//! increasing id. A segment is only ever appended to; when the next record
//! does not fit, the writer rotates to a new segment.

use crate::entry::WalRecord;
use crate::error::WalError;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier.
pub type SegmentId = u64;

const SEGMENT_EXTENSION: &str = "wal";

/// Segment file name: 16 hex digits plus extension.
pub fn segment_filename(id: SegmentId) -> String {
    format!("{:016x}.{}", id, SEGMENT_EXTENSION)
}

/// Parses a segment id from a file name.
pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Lists segment ids present in `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_segment_filename(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// A single segment file.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    dirty: bool,
}

impl Segment {
    /// Creates a new, empty segment. Fails if the file already exists.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            file,
            size: 0,
            max_size,
            dirty: false,
        })
    }

    /// Opens an existing segment for reading and appending.
    pub fn open(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self, WalError> {
        let path = dir.join(segment_filename(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            id,
            path,
            file,
            size,
            max_size,
            dirty: false,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns whether a record of `record_size` bytes fits. An empty
    /// segment accepts any record so oversized records still land somewhere.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.size == 0 || self.size + record_size as u64 <= self.max_size
    }

    /// Appends a record and returns its offset within the segment.
    pub fn append(&mut self, record: &WalRecord) -> Result<u64, WalError> {
        let encoded = record.encode()?;
        let offset = self.size;

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.dirty = true;

        Ok(offset)
    }

    /// Flushes written data to disk if anything is pending.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Reads the raw bytes of the whole segment.
    pub fn read_bytes(&mut self) -> Result<BytesMut, WalError> {
        let mut raw = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut raw)?;
        Ok(BytesMut::from(&raw[..]))
    }

    /// Reads every complete record, with its offset.
    ///
    /// Stops at the first incomplete record or zero padding; a corrupted
    /// record is an error.
    pub fn read_records(&mut self) -> Result<Vec<(u64, WalRecord)>, WalError> {
        let mut buf = self.read_bytes()?;
        let mut records = Vec::new();
        let mut offset = 0u64;

        while let Some(record) = WalRecord::decode(&mut buf, offset)? {
            let size = record.disk_size() as u64;
            records.push((offset, record));
            offset += size;
        }

        Ok(records)
    }

    /// Truncates the segment to `offset` bytes, dropping a torn tail.
    pub fn truncate_at(&mut self, offset: u64) -> Result<(), WalError> {
        self.file.set_len(offset)?;
        self.size = offset;
        self.file.sync_all()?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{WalEntry, WalEntryType};
    use crate::DEFAULT_SEGMENT_SIZE;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn checkpoint(seq: u64) -> WalRecord {
        WalRecord::from_entry(&WalEntry::Checkpoint { timestamp: seq as i64 }, seq).unwrap()
    }

    #[test]
    fn test_segment_filenames() {
        assert_eq!(segment_filename(1), "0000000000000001.wal");
        assert_eq!(segment_filename(0xBEEF), "000000000000beef.wal");
        assert_eq!(parse_segment_filename("000000000000beef.wal"), Some(0xBEEF));
        assert_eq!(parse_segment_filename("000000000000beef.log"), None);
        assert_eq!(parse_segment_filename("beef.wal"), None);
        assert_eq!(parse_segment_filename("000000000000beefwal"), None);
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, DEFAULT_SEGMENT_SIZE).unwrap();

        let first = segment.append(&checkpoint(1)).unwrap();
        let second = segment.append(&checkpoint(2)).unwrap();
        segment.sync().unwrap();

        assert_eq!(first, 0);
        assert!(second > 0);

        let records = segment.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, second);
        assert_eq!(records[1].1.header.sequence, 2);
    }

    #[test]
    fn test_reopen_preserves_size() {
        let dir = TempDir::new().unwrap();
        let size = {
            let mut segment = Segment::create(dir.path(), 3, DEFAULT_SEGMENT_SIZE).unwrap();
            segment.append(&checkpoint(1)).unwrap();
            segment.sync().unwrap();
            segment.size()
        };

        let reopened = Segment::open(dir.path(), 3, DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(reopened.size(), size);
        assert_eq!(list_segments(dir.path()).unwrap(), vec![3]);
    }

    #[test]
    fn test_can_fit_and_truncate() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::create(dir.path(), 1, 64).unwrap();
        let record = WalRecord::new(WalEntryType::Checkpoint, 1, Bytes::from(vec![b'a'; 30]));

        assert!(segment.can_fit(1000));
        segment.append(&record).unwrap();
        assert!(!segment.can_fit(record.disk_size()));

        segment.truncate_at(0).unwrap();
        assert_eq!(segment.size(), 0);
        assert!(segment.read_records().unwrap().is_empty());
    }
}
