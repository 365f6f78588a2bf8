//! Log entries and their on-disk record format.
//!
//! Each record is laid out as:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ length: u32 (includes itself)        │
//! │ kind: u8                             │
//! │ term: u64                            │
//! │ timestamp: u64 (unix millis)         │
//! │ key_len: varint                      │
//! │ key bytes                            │
//! │ payload bytes (to end of record)     │
//! └──────────────────────────────────────┘
//! ```
//!
//! The index is not stored; it is implicit from the entry's offset within its
//! segment. A zero length word terminates a scan, which is what makes
//! skip-scan recovery and zero-padded tails safe.

use buffer::{ReadCursor, WriteCursor, var_u64_len};
use common::{Error, Index, Result, Term};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed portion of a record: length + kind + term + timestamp.
const RECORD_FIXED_LEN: usize = 4 + 1 + 8 + 8;

/// Smallest well-formed record: fixed fields plus a one-byte empty key length.
pub const MIN_RECORD_LEN: usize = RECORD_FIXED_LEN + 1;

/// What an entry carries through the replicated log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Appended by a fresh leader to commit prior-term entries.
    NoOp,
    /// A user command destined for the state machine.
    Command,
    /// A membership view change.
    Configuration,
}

impl EntryKind {
    pub fn as_u8(self) -> u8 {
        match self {
            EntryKind::NoOp => 0,
            EntryKind::Command => 1,
            EntryKind::Configuration => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EntryKind::NoOp),
            1 => Ok(EntryKind::Command),
            2 => Ok(EntryKind::Configuration),
            other => Err(Error::Corruption(format!("unknown entry kind {other}"))),
        }
    }
}

/// A single replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

impl Entry {
    /// Create an entry stamped with the current wall clock.
    pub fn new(index: Index, term: Term, kind: EntryKind, key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind,
            key,
            payload,
            timestamp: unix_millis(),
        }
    }

    /// The no-op entry a fresh leader appends at its new term.
    pub fn noop(index: Index, term: Term) -> Self {
        Self::new(index, term, EntryKind::NoOp, Vec::new(), Vec::new())
    }

    /// Total record length on disk, including the length word.
    pub fn record_len(&self) -> usize {
        RECORD_FIXED_LEN + var_u64_len(self.key.len() as u64) + self.key.len() + self.payload.len()
    }

    /// Write the full record through `w`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Buffer` if the cursor's region is too small.
    pub fn encode(&self, w: &mut WriteCursor<'_>) -> Result<()> {
        w.put_u32(self.record_len() as u32)?;
        w.put_u8(self.kind.as_u8())?;
        w.put_u64(self.term)?;
        w.put_u64(self.timestamp)?;
        w.put_var_u64(self.key.len() as u64)?;
        w.put_bytes(&self.key)?;
        w.put_bytes(&self.payload)?;
        Ok(())
    }

    /// Parse one record. The caller supplies the entry's index, which is
    /// implicit from its offset within the segment.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corruption` on a malformed record.
    pub fn decode(r: &mut ReadCursor<'_>, index: Index) -> Result<Self> {
        let length = r.get_u32()? as usize;
        if length < MIN_RECORD_LEN {
            return Err(Error::Corruption(format!(
                "entry record of {length} bytes is below the {MIN_RECORD_LEN} byte minimum"
            )));
        }
        let kind = EntryKind::from_u8(r.get_u8()?)?;
        let term = r.get_u64()?;
        let timestamp = r.get_u64()?;
        let key_len = r.get_var_u64()? as usize;
        let consumed = RECORD_FIXED_LEN + var_u64_len(key_len as u64) + key_len;
        if consumed > length {
            return Err(Error::Corruption(format!(
                "entry key of {key_len} bytes overruns its {length} byte record"
            )));
        }
        let key = r.get_bytes(key_len)?.to_vec();
        let payload = r.get_bytes(length - consumed)?.to_vec();
        Ok(Self {
            index,
            term,
            kind,
            key,
            payload,
            timestamp,
        })
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer::Buffer;

    #[test]
    fn record_roundtrip() {
        let entry = Entry::new(7, 3, EntryKind::Command, b"foo".to_vec(), b"bar=1".to_vec());

        let mut buf = Buffer::with_capacity(128);
        entry.encode(&mut buf.writer()).unwrap();
        assert_eq!(buf.limit(), entry.record_len());

        let decoded = Entry::decode(&mut buf.reader(), 7).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn empty_key_and_payload() {
        let entry = Entry::noop(1, 1);
        let mut buf = Buffer::with_capacity(64);
        entry.encode(&mut buf.writer()).unwrap();
        assert_eq!(entry.record_len(), MIN_RECORD_LEN);

        let decoded = Entry::decode(&mut buf.reader(), 1).unwrap();
        assert_eq!(decoded.kind, EntryKind::NoOp);
        assert!(decoded.key.is_empty());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn rejects_malformed_records() {
        // Undersized length word.
        let mut buf = Buffer::with_capacity(64);
        buf.writer().put_u32(4).unwrap();
        assert!(matches!(
            Entry::decode(&mut buf.reader(), 1),
            Err(Error::Corruption(_))
        ));

        // Unknown kind byte.
        let entry = Entry::noop(1, 1);
        let mut buf = Buffer::with_capacity(64);
        entry.encode(&mut buf.writer()).unwrap();
        buf.writer_at(4).unwrap().put_u8(9).unwrap();
        assert!(matches!(
            Entry::decode(&mut buf.reader(), 1),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn kind_byte_roundtrip() {
        for kind in [EntryKind::NoOp, EntryKind::Command, EntryKind::Configuration] {
            assert_eq!(EntryKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
        assert!(EntryKind::from_u8(3).is_err());
    }
}
