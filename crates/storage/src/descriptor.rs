//! The fixed-size header identifying a segment file.
//!
//! The descriptor occupies the first 64 bytes of every segment data file:
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ magic: u32 (0x434C4F47 "CLOG")     │
//! │ crc32: u32 (over bytes 8..64)      │
//! │ id: u64                            │
//! │ version: u64                       │
//! │ index: u64 (first index)           │
//! │ range: i64 (entry capacity)        │
//! │ max_entry_size: u32                │
//! │ max_segment_size: u32              │
//! │ locked: u8                         │
//! │ zero pad to 64                     │
//! └────────────────────────────────────┘
//! ```
//!
//! It is written once at segment creation; only the `locked` flag (and with
//! it the crc) is ever rewritten, after every entry in the segment has been
//! committed. Recovery arbitrates between versions of the same segment id by
//! this flag.

use common::{Error, Index, Result};

/// Magic bytes at the start of every segment data file: "CLOG".
pub const SEGMENT_MAGIC: u32 = 0x434C_4F47;

/// Size of the descriptor header in bytes.
pub const DESCRIPTOR_LEN: usize = 64;

/// Identity and shape of one segment, embedded in its data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Monotonically increasing segment number within the log.
    pub id: u64,
    /// Bumped by each compaction of this segment; on-disk files of older
    /// versions are superseded.
    pub version: u64,
    /// First log index covered by this segment.
    pub index: Index,
    /// Entry capacity of the segment's offset index, fixed at creation.
    pub range: i64,
    /// Hard cap on a single record, in bytes.
    pub max_entry_size: u32,
    /// Soft cap on the data file before rotation, in bytes.
    pub max_segment_size: u32,
    /// Set once every entry in the segment has been committed.
    pub locked: bool,
}

impl SegmentDescriptor {
    /// Serialize the header, computing the crc.
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index.to_le_bytes());
        buf[32..40].copy_from_slice(&self.range.to_le_bytes());
        buf[40..44].copy_from_slice(&self.max_entry_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.max_segment_size.to_le_bytes());
        buf[48] = self.locked as u8;

        let crc = crc32fast::hash(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a header.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corruption` on bad magic, a crc mismatch, or a short
    /// header.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_LEN {
            return Err(Error::Corruption(format!(
                "segment header truncated at {} bytes",
                bytes.len()
            )));
        }
        let buf: &[u8; DESCRIPTOR_LEN] = bytes[..DESCRIPTOR_LEN]
            .try_into()
            .map_err(|_| Error::Corruption("segment header truncated".into()))?;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(Error::Corruption(format!(
                "bad segment magic {magic:#010x}"
            )));
        }
        let crc = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let computed = crc32fast::hash(&buf[8..]);
        if crc != computed {
            return Err(Error::Corruption(format!(
                "segment header crc {crc:#010x} does not match {computed:#010x}"
            )));
        }

        let locked = match buf[48] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::Corruption(format!(
                    "segment locked flag has value {other}"
                )));
            }
        };

        Ok(Self {
            id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            version: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            index: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            range: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
            max_entry_size: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            max_segment_size: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
            locked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SegmentDescriptor {
        SegmentDescriptor {
            id: 3,
            version: 2,
            index: 4097,
            range: 1024,
            max_entry_size: 1 << 16,
            max_segment_size: 1 << 22,
            locked: false,
        }
    }

    #[test]
    fn header_roundtrip() {
        let desc = descriptor();
        let bytes = desc.encode();
        assert_eq!(bytes.len(), DESCRIPTOR_LEN);
        assert_eq!(SegmentDescriptor::decode(&bytes).unwrap(), desc);
    }

    #[test]
    fn locked_flag_changes_crc() {
        let mut desc = descriptor();
        let unlocked = desc.encode();
        desc.locked = true;
        let locked = desc.encode();
        assert_ne!(unlocked[4..8], locked[4..8]);
        assert!(SegmentDescriptor::decode(&locked).unwrap().locked);
    }

    #[test]
    fn rejects_flipped_bit() {
        let mut bytes = descriptor().encode();
        bytes[20] ^= 0x01;
        assert!(matches!(
            SegmentDescriptor::decode(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn rejects_bad_magic_and_short_header() {
        let mut bytes = descriptor().encode();
        bytes[0] = 0;
        assert!(SegmentDescriptor::decode(&bytes).is_err());
        assert!(SegmentDescriptor::decode(&[0u8; 10]).is_err());
    }
}
