//! WAL recovery.
//!
//! A crash can leave the newest segment with a partially written record at
//! its tail. Recovery scans every segment, stops at the first record that is
//! incomplete or fails its checksum, and (when repairing) truncates the
//! segment there so the log again ends on a record boundary.

use crate::entry::WalRecord;
use crate::error::WalError;
use crate::segment::{list_segments, Segment, SegmentId};
use std::path::Path;

/// Outcome of a recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Complete records with valid checksums.
    pub valid_records: u64,
    /// Bytes past the last valid record (removed when repairing).
    pub bytes_truncated: u64,
    /// Segments that had a damaged tail.
    pub segments_repaired: Vec<SegmentId>,
    /// Segments that could not be scanned at all.
    pub segments_with_errors: Vec<(SegmentId, String)>,
    /// Highest sequence number seen.
    pub max_sequence: u64,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.bytes_truncated == 0 && self.segments_with_errors.is_empty()
    }
}

struct SegmentScan {
    valid_records: u64,
    valid_len: u64,
    file_len: u64,
    max_sequence: u64,
}

fn scan_segment(segment: &mut Segment) -> Result<SegmentScan, WalError> {
    let mut buf = segment.read_bytes()?;
    let file_len = buf.len() as u64;
    let mut scan = SegmentScan {
        valid_records: 0,
        valid_len: 0,
        file_len,
        max_sequence: 0,
    };

    loop {
        match WalRecord::decode(&mut buf, scan.valid_len) {
            Ok(Some(record)) => {
                scan.valid_records += 1;
                scan.valid_len += record.disk_size() as u64;
                scan.max_sequence = scan.max_sequence.max(record.header.sequence);
            }
            Ok(None) => break,
            Err(e) if e.is_integrity_violation() => {
                tracing::warn!(
                    segment = segment.id(),
                    offset = scan.valid_len,
                    error = %e,
                    "Damaged record in WAL segment"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(scan)
}

fn scan(dir: &Path, segment_size: u64, repair: bool) -> Result<RecoveryReport, WalError> {
    let mut report = RecoveryReport::default();

    for id in list_segments(dir)? {
        let mut segment = match Segment::open(dir, id, segment_size) {
            Ok(segment) => segment,
            Err(e) => {
                report.segments_with_errors.push((id, e.to_string()));
                continue;
            }
        };

        let scan = match scan_segment(&mut segment) {
            Ok(scan) => scan,
            Err(e) => {
                report.segments_with_errors.push((id, e.to_string()));
                continue;
            }
        };

        report.valid_records += scan.valid_records;
        report.max_sequence = report.max_sequence.max(scan.max_sequence);

        let excess = scan.file_len - scan.valid_len;
        if excess > 0 {
            report.bytes_truncated += excess;
            report.segments_repaired.push(id);

            if repair {
                segment.truncate_at(scan.valid_len)?;
                tracing::warn!(
                    segment = id,
                    offset = scan.valid_len,
                    removed = excess,
                    "Truncated WAL segment"
                );
            }
        }
    }

    Ok(report)
}

/// Scans the WAL without modifying it.
pub fn verify_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryReport, WalError> {
    scan(dir.as_ref(), segment_size, false)
}

/// Scans the WAL and truncates damaged segment tails.
pub fn repair_wal(dir: impl AsRef<Path>, segment_size: u64) -> Result<RecoveryReport, WalError> {
    scan(dir.as_ref(), segment_size, true)
}
