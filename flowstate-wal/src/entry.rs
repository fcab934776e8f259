//! WAL entry types and record framing.
//!
//! Each record is laid out on disk as:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | sequence_number     | payload (JSON-encoded WalEntry)           |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```

use crate::error::WalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every record.
pub const WAL_MAGIC: [u8; 4] = *b"FLOW";

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Type tag stored in the record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    CreateRun = 1,
    CommitTransition = 2,
    DeleteState = 3,
    DeleteRun = 4,
    SetConcurrencyLimit = 5,
    Checkpoint = 6,
}

impl TryFrom<u8> for WalEntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::CreateRun),
            2 => Ok(WalEntryType::CommitTransition),
            3 => Ok(WalEntryType::DeleteState),
            4 => Ok(WalEntryType::DeleteRun),
            5 => Ok(WalEntryType::SetConcurrencyLimit),
            6 => Ok(WalEntryType::Checkpoint),
            other => Err(other),
        }
    }
}

/// Parsed record header.
#[derive(Debug, Clone)]
pub struct WalRecordHeader {
    pub entry_type: WalEntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub sequence: u64,
}

impl WalRecordHeader {
    /// Parses a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` if fewer than [`RECORD_HEADER_SIZE`] bytes are
    /// available or the header is zero padding.
    fn parse(buf: &[u8], offset: u64) -> Result<Option<Self>, WalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..RECORD_HEADER_SIZE];
        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);

        if magic != WAL_MAGIC {
            if magic == [0; 4] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let raw_type = header.get_u8();
        let entry_type =
            WalEntryType::try_from(raw_type).map_err(|t| WalError::InvalidHeader {
                offset,
                reason: format!("unknown entry type: {}", t),
            })?;
        let flags = header.get_u8();
        header.advance(2);
        let payload_len = header.get_u32();
        let crc32c = header.get_u32();
        let sequence = header.get_u64();

        if payload_len as usize > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: payload_len as usize,
                max: MAX_RECORD_SIZE,
            });
        }

        Ok(Some(Self {
            entry_type,
            flags,
            payload_len,
            crc32c,
            sequence,
        }))
    }
}

/// A complete record (header + payload).
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub header: WalRecordHeader,
    pub payload: Bytes,
}

impl WalRecord {
    pub fn new(entry_type: WalEntryType, sequence: u64, payload: Bytes) -> Self {
        Self {
            header: WalRecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc32c::crc32c(&payload),
                sequence,
            },
            payload,
        }
    }

    /// Serializes an entry into a record with the given sequence number.
    pub fn from_entry(entry: &WalEntry, sequence: u64) -> Result<Self, WalError> {
        let payload = serde_json::to_vec(entry)?;
        Ok(Self::new(entry.entry_type(), sequence, Bytes::from(payload)))
    }

    /// Deserializes the payload back into an entry.
    pub fn entry(&self) -> Result<WalEntry, WalError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<BytesMut, WalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&WAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.sequence);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one record from the front of `buf`, consuming it.
    ///
    /// Returns `Ok(None)` when the buffer holds an incomplete record or
    /// zero padding; the buffer is left untouched in that case.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, WalError> {
        let header = match WalRecordHeader::parse(buf, offset)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total_len = RECORD_HEADER_SIZE + header.payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(header.payload_len as usize).freeze();

        let actual = crc32c::crc32c(&payload);
        if actual != header.crc32c {
            return Err(WalError::CorruptedRecord {
                offset,
                expected: header.crc32c,
                actual,
            });
        }

        Ok(Some(Self { header, payload }))
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// A change to a concurrency slot pool, committed together with a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SlotChange {
    Acquire { tag: String, run_id: String },
    Release { tag: String, run_id: String },
}

impl SlotChange {
    pub fn tag(&self) -> &str {
        match self {
            SlotChange::Acquire { tag, .. } | SlotChange::Release { tag, .. } => tag,
        }
    }
}

/// Typed WAL entry.
///
/// Domain records (runs, states) are carried as JSON values so the log
/// stays independent of the engine's types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalEntry {
    CreateRun {
        run_id: String,
        run: serde_json::Value,
    },
    /// One committed unit of work: the new state, the run's updated pointer
    /// and counters, and the slot changes made by rules.
    CommitTransition {
        run_id: String,
        state: serde_json::Value,
        run: serde_json::Value,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        slots: Vec<SlotChange>,
    },
    DeleteState {
        run_id: String,
        state_id: String,
    },
    DeleteRun {
        run_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        slots: Vec<SlotChange>,
    },
    SetConcurrencyLimit {
        tag: String,
        /// `None` removes the limit.
        limit: Option<u32>,
    },
    Checkpoint {
        timestamp: i64,
    },
}

impl WalEntry {
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntry::CreateRun { .. } => WalEntryType::CreateRun,
            WalEntry::CommitTransition { .. } => WalEntryType::CommitTransition,
            WalEntry::DeleteState { .. } => WalEntryType::DeleteState,
            WalEntry::DeleteRun { .. } => WalEntryType::DeleteRun,
            WalEntry::SetConcurrencyLimit { .. } => WalEntryType::SetConcurrencyLimit,
            WalEntry::Checkpoint { .. } => WalEntryType::Checkpoint,
        }
    }

    /// Returns the run ID if this entry concerns a single run.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            WalEntry::CreateRun { run_id, .. }
            | WalEntry::CommitTransition { run_id, .. }
            | WalEntry::DeleteState { run_id, .. }
            | WalEntry::DeleteRun { run_id, .. } => Some(run_id),
            WalEntry::SetConcurrencyLimit { .. } | WalEntry::Checkpoint { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit_entry() -> WalEntry {
        WalEntry::CommitTransition {
            run_id: "r-1".to_string(),
            state: json!({"kind": "RUNNING"}),
            run: json!({"run_count": 1}),
            slots: vec![SlotChange::Acquire {
                tag: "db".to_string(),
                run_id: "r-1".to_string(),
            }],
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = WalRecord::from_entry(&commit_entry(), 42).unwrap();
        let mut buf = record.encode().unwrap();
        let decoded = WalRecord::decode(&mut buf, 0).unwrap().unwrap();

        assert!(buf.is_empty());
        assert_eq!(decoded.header.entry_type, WalEntryType::CommitTransition);
        assert_eq!(decoded.header.sequence, 42);
        match decoded.entry().unwrap() {
            WalEntry::CommitTransition { run_id, slots, .. } => {
                assert_eq!(run_id, "r-1");
                assert_eq!(slots.len(), 1);
                assert_eq!(slots[0].tag(), "db");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let record = WalRecord::from_entry(&commit_entry(), 1).unwrap();
        let mut encoded = record.encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let result = WalRecord::decode(&mut encoded, 0);
        assert!(matches!(result, Err(WalError::CorruptedRecord { .. })));
    }

    #[test]
    fn test_partial_record_is_not_consumed() {
        let record = WalRecord::from_entry(&commit_entry(), 1).unwrap();
        let encoded = record.encode().unwrap();
        let mut partial = BytesMut::from(&encoded[..encoded.len() - 3]);
        let len_before = partial.len();

        assert!(WalRecord::decode(&mut partial, 0).unwrap().is_none());
        assert_eq!(partial.len(), len_before);
    }

    #[test]
    fn test_zero_padding_reads_as_end() {
        let mut buf = BytesMut::from(&[0u8; RECORD_HEADER_SIZE][..]);
        assert!(WalRecord::decode(&mut buf, 0).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_and_type() {
        let mut buf = BytesMut::from(&[b'X'; RECORD_HEADER_SIZE][..]);
        assert!(matches!(
            WalRecord::decode(&mut buf, 7),
            Err(WalError::InvalidHeader { offset: 7, .. })
        ));

        let record = WalRecord::from_entry(&WalEntry::Checkpoint { timestamp: 1 }, 1).unwrap();
        let mut encoded = record.encode().unwrap();
        encoded[4] = 200;
        assert!(matches!(
            WalRecord::decode(&mut encoded, 0),
            Err(WalError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_oversized_record_rejected() {
        let record = WalRecord::new(
            WalEntryType::Checkpoint,
            1,
            Bytes::from(vec![0u8; MAX_RECORD_SIZE + 1]),
        );
        assert!(matches!(
            record.encode(),
            Err(WalError::RecordTooLarge { .. })
        ));
    }

    #[test]
    fn test_entry_run_ids() {
        assert_eq!(commit_entry().run_id(), Some("r-1"));
        let limit = WalEntry::SetConcurrencyLimit {
            tag: "db".to_string(),
            limit: Some(2),
        };
        assert_eq!(limit.run_id(), None);
        assert_eq!(limit.entry_type(), WalEntryType::SetConcurrencyLimit);

        let json = serde_json::to_value(&limit).unwrap();
        assert_eq!(json["type"], "set_concurrency_limit");
    }
}
