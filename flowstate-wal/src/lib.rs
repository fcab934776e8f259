//! # flowstate-wal
//!
//! Write-ahead log backing the flowstate run store.
//!
//! Every committed unit of work (a run creation, a state transition with its
//! run counters and slot changes, an administrative deletion) is a single
//! framed record, so a record is either fully present or truncated away on
//! recovery. The log provides:
//! - Per-record CRC32C checksums
//! - Segment files with rotation
//! - Configurable fsync policies
//! - Repair of torn writes at the tail of a segment
//! - An exclusive lock on the log directory
//! - Deletion of segments already captured by a snapshot

pub mod entry;
pub mod error;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use entry::{SlotChange, WalEntry, WalEntryType, WalRecord};
pub use error::WalError;
pub use recovery::{repair_wal, verify_wal, RecoveryReport};
pub use segment::{Segment, SegmentId};
pub use wal::{FsyncPolicy, Wal, WalConfig, WalOffset, WalStats, LOCK_FILENAME};

/// Default segment size (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 24;
