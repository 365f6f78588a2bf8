//! The per-segment offset index: a mapping from entry offset (position of the
//! entry within the segment's logical range) to byte position in the data
//! file.
//!
//! Two on-disk encodings share a 9-byte header `{magic u32, format u8,
//! next_offset u32}`:
//!
//! - *ordered* (format 0): packed `u32` positions, one per offset, entry
//!   count inferred from the file length. Used while the segment is dense.
//! - *searchable* (format 1): `{u32 offset, u32 position}` pairs sorted by
//!   offset. Used once a `skip` or a compaction introduces gaps.
//!
//! `next_offset` records the logical end of the segment including trailing
//! skipped offsets; it is refreshed at flush points (skip, truncate, seal,
//! close), so a crash may lose a trailing skip but never an entry.
//!
//! In memory the index is always a sorted `(offset, position)` vector with
//! binary search; the encoding is chosen at write time.

use common::{Error, Result};
use log::debug;

/// Magic bytes at the start of every index file: "CIDX".
pub const INDEX_MAGIC: u32 = 0x4349_4458;

/// Size of the index file header in bytes.
pub const INDEX_HEADER_LEN: usize = 9;

const FORMAT_ORDERED: u8 = 0;
const FORMAT_SEARCHABLE: u8 = 1;

/// In-memory offset index of one segment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetIndex {
    /// Sorted by offset; positions are strictly ascending as well.
    entries: Vec<(u32, u32)>,
    /// One past the highest assigned offset, including skipped offsets.
    next_offset: u32,
}

impl OffsetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries actually present (skipped offsets excluded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One past the highest assigned offset, including skips.
    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn last_offset(&self) -> Option<u32> {
        self.entries.last().map(|&(o, _)| o)
    }

    /// Whether every offset below `next_offset` holds an entry, making the
    /// ordered encoding applicable.
    pub fn is_dense(&self) -> bool {
        self.entries.len() as u32 == self.next_offset
    }

    /// Byte position of the entry at `offset`, or `None` for a skipped or
    /// compacted-away offset.
    pub fn position(&self, offset: u32) -> Option<u32> {
        self.entries
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|i| self.entries[i].1)
    }

    /// Record an entry at the next offset; returns the offset assigned.
    pub fn append(&mut self, position: u32) -> u32 {
        let offset = self.next_offset;
        self.entries.push((offset, position));
        self.next_offset += 1;
        offset
    }

    /// Record an entry at an explicit offset, as compaction replay does.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if `offset` is below `next_offset`.
    pub fn append_at(&mut self, offset: u32, position: u32) -> Result<()> {
        if offset < self.next_offset {
            return Err(Error::Storage(format!(
                "offset {offset} below next offset {}",
                self.next_offset
            )));
        }
        self.entries.push((offset, position));
        self.next_offset = offset + 1;
        Ok(())
    }

    /// Advance the logical end by `n` offsets without recording entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the segment's offset space would overflow.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        let next = u64::from(self.next_offset) + n;
        if next > u64::from(u32::MAX) {
            return Err(Error::Storage(format!("skip of {n} overflows the segment")));
        }
        self.next_offset = next as u32;
        Ok(())
    }

    /// Drop every entry above `keep_through` and pull the logical end back to
    /// it.
    pub fn truncate(&mut self, keep_through: u32) {
        self.entries.retain(|&(o, _)| o <= keep_through);
        self.next_offset = keep_through + 1;
    }

    /// The last present entry as an `(offset, position)` pair.
    pub fn last_entry(&self) -> Option<(u32, u32)> {
        self.entries.last().copied()
    }

    /// Drop the last entry, pulling the logical end back with it. Used only
    /// when discarding a torn record during recovery.
    pub fn pop(&mut self) -> Option<(u32, u32)> {
        let popped = self.entries.pop();
        self.next_offset = self.entries.last().map(|&(o, _)| o + 1).unwrap_or(0);
        popped
    }

    /// Serialize, choosing the ordered encoding while dense.
    pub fn encode(&self) -> Vec<u8> {
        let dense = self.is_dense();
        let record = if dense { 4 } else { 8 };
        let mut out = Vec::with_capacity(INDEX_HEADER_LEN + self.entries.len() * record);
        out.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
        out.push(if dense { FORMAT_ORDERED } else { FORMAT_SEARCHABLE });
        out.extend_from_slice(&self.next_offset.to_le_bytes());
        for &(offset, position) in &self.entries {
            if !dense {
                out.extend_from_slice(&offset.to_le_bytes());
            }
            out.extend_from_slice(&position.to_le_bytes());
        }
        out
    }

    /// Parse an index file.
    ///
    /// A trailing partial record (a crash mid-append) is dropped; a stale
    /// `next_offset` in the header is superseded by the entries themselves.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corruption` on a bad header or out-of-order entries.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_HEADER_LEN {
            return Err(Error::Corruption(format!(
                "index header truncated at {} bytes",
                bytes.len()
            )));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != INDEX_MAGIC {
            return Err(Error::Corruption(format!("bad index magic {magic:#010x}")));
        }
        let format = bytes[4];
        let stored_next = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let body = &bytes[INDEX_HEADER_LEN..];

        let record = match format {
            FORMAT_ORDERED => 4,
            FORMAT_SEARCHABLE => 8,
            other => {
                return Err(Error::Corruption(format!("unknown index format {other}")));
            }
        };
        let whole = body.len() / record;
        if body.len() % record != 0 {
            debug!(
                "dropping {} trailing bytes of a partial index record",
                body.len() % record
            );
        }

        let mut entries = Vec::with_capacity(whole);
        for i in 0..whole {
            let at = i * record;
            let (offset, position) = if format == FORMAT_ORDERED {
                (
                    i as u32,
                    u32::from_le_bytes(body[at..at + 4].try_into().unwrap()),
                )
            } else {
                (
                    u32::from_le_bytes(body[at..at + 4].try_into().unwrap()),
                    u32::from_le_bytes(body[at + 4..at + 8].try_into().unwrap()),
                )
            };
            if let Some(&(last_offset, last_position)) = entries.last() {
                if offset <= last_offset || position <= last_position {
                    return Err(Error::Corruption(format!(
                        "index entry ({offset}, {position}) not after ({last_offset}, {last_position})"
                    )));
                }
            }
            entries.push((offset, position));
        }

        let min_next = entries.last().map(|&(o, _)| o + 1).unwrap_or(0);
        Ok(Self {
            entries,
            next_offset: stored_next.max(min_next),
        })
    }

    /// Rebuild a dense index from scanned record positions.
    pub fn from_positions(positions: &[u32]) -> Self {
        Self {
            entries: positions
                .iter()
                .enumerate()
                .map(|(i, &p)| (i as u32, p))
                .collect(),
            next_offset: positions.len() as u32,
        }
    }

    /// Iterate `(offset, position)` pairs in offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().copied()
    }

    /// Drop entries whose positions fall at or beyond `data_len`, which
    /// happens when the index was flushed ahead of a data write that never
    /// completed.
    pub fn clamp_to_data(&mut self, data_len: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&(_, p)| u64::from(p) < data_len);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.next_offset = self.entries.last().map(|&(o, _)| o + 1).unwrap_or(0);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_append_and_lookup() {
        let mut index = OffsetIndex::new();
        assert_eq!(index.append(64), 0);
        assert_eq!(index.append(100), 1);
        assert_eq!(index.append(150), 2);
        assert!(index.is_dense());
        assert_eq!(index.position(1), Some(100));
        assert_eq!(index.position(3), None);
        assert_eq!(index.next_offset(), 3);
    }

    #[test]
    fn skip_introduces_gap() {
        let mut index = OffsetIndex::new();
        index.append(64);
        index.skip(2).unwrap();
        let offset = index.append(90);
        assert_eq!(offset, 3);
        assert!(!index.is_dense());
        assert_eq!(index.position(1), None);
        assert_eq!(index.position(2), None);
        assert_eq!(index.position(3), Some(90));
    }

    #[test]
    fn ordered_encoding_roundtrip() {
        let mut index = OffsetIndex::new();
        index.append(64);
        index.append(100);
        let bytes = index.encode();
        assert_eq!(bytes[4], FORMAT_ORDERED);
        assert_eq!(bytes.len(), INDEX_HEADER_LEN + 2 * 4);
        assert_eq!(OffsetIndex::decode(&bytes).unwrap(), index);
    }

    #[test]
    fn searchable_encoding_roundtrip() {
        let mut index = OffsetIndex::new();
        index.append(64);
        index.skip(5).unwrap();
        index.append(90);
        index.skip(1).unwrap();
        let bytes = index.encode();
        assert_eq!(bytes[4], FORMAT_SEARCHABLE);
        let decoded = OffsetIndex::decode(&bytes).unwrap();
        assert_eq!(decoded, index);
        // The trailing skip survives through the header.
        assert_eq!(decoded.next_offset(), 8);
    }

    #[test]
    fn truncate_pulls_back_logical_end() {
        let mut index = OffsetIndex::new();
        for p in [64u32, 100, 150, 220] {
            index.append(p);
        }
        index.truncate(1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.next_offset(), 2);
        assert_eq!(index.position(2), None);
        assert!(index.is_dense());
    }

    #[test]
    fn decode_drops_partial_tail() {
        let mut index = OffsetIndex::new();
        index.append(64);
        index.append(100);
        let mut bytes = index.encode();
        bytes.extend_from_slice(&[0xff, 0xff]); // partial record
        let decoded = OffsetIndex::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn decode_rejects_disorder() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
        bytes.push(FORMAT_SEARCHABLE);
        bytes.extend_from_slice(&5u32.to_le_bytes());
        for (o, p) in [(3u32, 100u32), (2, 200)] {
            bytes.extend_from_slice(&o.to_le_bytes());
            bytes.extend_from_slice(&p.to_le_bytes());
        }
        assert!(matches!(
            OffsetIndex::decode(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn clamp_to_data_drops_stale_entries() {
        let mut index = OffsetIndex::new();
        index.append(64);
        index.append(100);
        index.append(150);
        assert_eq!(index.clamp_to_data(120), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.next_offset(), 2);
    }
}
