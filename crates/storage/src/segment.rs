//! A single segment: one data file paired with one offset index file.
//!
//! The active segment appends through a read/write file handle; sealed
//! segments reopen their data as a read-only memory map. Reads never touch
//! the write path, so a segment can serve lookups while the log appends.

use crate::descriptor::{DESCRIPTOR_LEN, SegmentDescriptor};
use crate::entry::{Entry, MIN_RECORD_LEN};
use crate::index::{INDEX_HEADER_LEN, OffsetIndex};
use buffer::{Buffer, Mapped};
use common::{Error, Index, Result};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Data file name for a segment: `{name}-{id:05}-{version:03}.log`.
pub fn data_file_name(name: &str, id: u64, version: u64) -> String {
    format!("{name}-{id:05}-{version:03}.log")
}

/// Index file name for a segment: `{name}-{id:05}-{version:03}.index`.
pub fn index_file_name(name: &str, id: u64, version: u64) -> String {
    format!("{name}-{id:05}-{version:03}.index")
}

enum SegmentState {
    Active {
        data: File,
        index_file: File,
    },
    Sealed {
        map: Mapped,
    },
}

/// One segment of the log.
pub struct Segment {
    descriptor: SegmentDescriptor,
    data_path: PathBuf,
    index_path: PathBuf,
    index: OffsetIndex,
    state: SegmentState,
    /// End of the last complete record in the data file.
    size: u64,
    /// Commit watermark within this segment; 0 while nothing is committed.
    commit_index: Index,
}

impl Segment {
    /// Create a fresh segment, writing its descriptor and an empty index.
    pub fn create(directory: &Path, name: &str, descriptor: SegmentDescriptor) -> Result<Self> {
        let data_path = directory.join(data_file_name(name, descriptor.id, descriptor.version));
        let index_path = directory.join(index_file_name(name, descriptor.id, descriptor.version));

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)?;
        data.write_all_at(&descriptor.encode(), 0)?;
        data.sync_all()?;

        let index = OffsetIndex::new();
        let mut index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&index_path)?;
        index_file.write_all(&index.encode())?;
        index_file.sync_all()?;

        debug!(
            "created segment {} (first index {})",
            data_path.display(),
            descriptor.index
        );

        Ok(Self {
            descriptor,
            data_path,
            index_path,
            index,
            state: SegmentState::Active { data, index_file },
            size: DESCRIPTOR_LEN as u64,
            commit_index: 0,
        })
    }

    /// Open an existing segment whose descriptor has already been read and
    /// validated against its filename.
    pub fn open(
        directory: &Path,
        name: &str,
        descriptor: SegmentDescriptor,
        active: bool,
    ) -> Result<Self> {
        let data_path = directory.join(data_file_name(name, descriptor.id, descriptor.version));
        let index_path = directory.join(index_file_name(name, descriptor.id, descriptor.version));

        let data = OpenOptions::new()
            .read(true)
            .write(active)
            .open(&data_path)?;
        let data_len = data.metadata()?.len();

        let mut index = match fs::read(&index_path) {
            Ok(bytes) => match OffsetIndex::decode(&bytes) {
                Ok(index) => index,
                Err(e) if descriptor.version == 1 => {
                    warn!(
                        "index {} unreadable ({e}), rebuilding from data",
                        index_path.display()
                    );
                    OffsetIndex::from_positions(&scan_positions(&data, data_len)?)
                }
                Err(e) => return Err(e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && descriptor.version == 1 => {
                warn!("index {} missing, rebuilding from data", index_path.display());
                OffsetIndex::from_positions(&scan_positions(&data, data_len)?)
            }
            Err(e) => return Err(e.into()),
        };

        // Drop index entries that outran the data file (a crash between the
        // index write and the data write), then find the true end of data.
        index.clamp_to_data(data_len);
        let size = loop {
            match index.last_entry() {
                None => break DESCRIPTOR_LEN as u64,
                Some((_, position)) => {
                    let position = u64::from(position);
                    if position + 4 <= data_len {
                        let length = u64::from(read_u32_at(&data, position)?);
                        if length >= MIN_RECORD_LEN as u64 && position + length <= data_len {
                            break position + length;
                        }
                    }
                    debug!(
                        "dropping index entry at position {position} past the end of {}",
                        data_path.display()
                    );
                    index.pop();
                }
            }
        };

        let commit_index = if descriptor.locked && index.next_offset() > 0 {
            descriptor.index + u64::from(index.next_offset()) - 1
        } else {
            0
        };

        let state = if active {
            let index_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&index_path)?;
            SegmentState::Active { data, index_file }
        } else {
            drop(data);
            SegmentState::Sealed {
                map: Mapped::open(&data_path)?,
            }
        };

        Ok(Self {
            descriptor,
            data_path,
            index_path,
            index,
            state,
            size,
            commit_index,
        })
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn first_index(&self) -> Index {
        self.descriptor.index
    }

    /// Last index covered by this segment, including skipped offsets;
    /// `first_index - 1` while empty.
    pub fn last_index(&self) -> Index {
        self.descriptor.index + u64::from(self.index.next_offset()) - 1
    }

    pub fn is_empty(&self) -> bool {
        self.index.next_offset() == 0
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SegmentState::Active { .. })
    }

    pub fn is_locked(&self) -> bool {
        self.descriptor.locked
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Whether `index` falls within this segment's logical range.
    pub fn contains(&self, index: Index) -> bool {
        !self.is_empty() && index >= self.first_index() && index <= self.last_index()
    }

    /// Whether appending a record of `record_len` bytes would still fit.
    pub fn has_room(&self, record_len: usize) -> bool {
        self.is_active()
            && self.size + record_len as u64 <= u64::from(self.descriptor.max_segment_size)
            && i64::from(self.index.next_offset()) < self.descriptor.range
    }

    /// Append an entry whose index must be this segment's next index.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the segment is sealed, full, or the index is out
    /// of sequence.
    pub fn append(&mut self, entry: &Entry, scratch: &mut Buffer) -> Result<Index> {
        let record_len = entry.record_len();
        let expected = self.first_index() + u64::from(self.index.next_offset());
        if entry.index != expected {
            return Err(Error::Storage(format!(
                "append of index {} out of sequence, expected {expected}",
                entry.index
            )));
        }
        if !self.has_room(record_len) {
            return Err(Error::Storage(format!(
                "segment {} cannot hold a {record_len} byte record",
                self.descriptor.id
            )));
        }
        let SegmentState::Active { data, .. } = &self.state else {
            return Err(Error::Storage("append to a sealed segment".into()));
        };

        scratch.clear();
        entry.encode(&mut scratch.writer())?;
        data.write_all_at(scratch.as_slice(), self.size)?;

        let position = self.size as u32;
        let offset = self.index.append(position);
        self.write_index_record(self.index.len() - 1, offset, position)?;
        self.size += record_len as u64;
        Ok(entry.index)
    }

    /// Append an entry at an explicit offset, leaving a gap. Used by
    /// compaction replay; the index file is rewritten when the caller
    /// finishes.
    pub fn append_at(&mut self, offset: u32, entry: &Entry, scratch: &mut Buffer) -> Result<()> {
        let SegmentState::Active { data, .. } = &self.state else {
            return Err(Error::Storage("append to a sealed segment".into()));
        };
        scratch.clear();
        entry.encode(&mut scratch.writer())?;
        data.write_all_at(scratch.as_slice(), self.size)?;
        self.index.append_at(offset, self.size as u32)?;
        self.size += entry.record_len() as u64;
        Ok(())
    }

    /// Read the entry at `index`, or `None` for an absent (skipped or
    /// compacted-away) offset.
    pub fn get(&self, index: Index, scratch: &mut Buffer) -> Result<Option<Entry>> {
        if !self.contains(index) {
            return Ok(None);
        }
        let offset = (index - self.first_index()) as u32;
        let Some(position) = self.index.position(offset) else {
            return Ok(None);
        };

        match &self.state {
            SegmentState::Active { data, .. } => {
                let length = read_u32_at(data, u64::from(position))? as usize;
                if length < MIN_RECORD_LEN || length > scratch.capacity() {
                    return Err(Error::Corruption(format!(
                        "entry record of {length} bytes at position {position} in segment {}",
                        self.descriptor.id
                    )));
                }
                scratch.clear();
                data.read_exact_at(&mut scratch.spare()[..length], u64::from(position))?;
                scratch.set_limit(length)?;
                Ok(Some(Entry::decode(&mut scratch.reader(), index)?))
            }
            SegmentState::Sealed { map } => {
                let mut r = map.reader_at(position as usize)?;
                Ok(Some(Entry::decode(&mut r, index)?))
            }
        }
    }

    /// Advance the logical end by `n` offsets without storing entries.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the segment is sealed or its offset capacity is
    /// exceeded.
    pub fn skip(&mut self, n: u64) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Storage("skip on a sealed segment".into()));
        }
        if u64::from(self.index.next_offset()) + n > self.descriptor.range.max(0) as u64 {
            return Err(Error::Storage(format!(
                "skip of {n} exceeds segment capacity {}",
                self.descriptor.range
            )));
        }
        self.index.skip(n)?;
        self.rewrite_index_file()
    }

    /// Number of offsets still assignable before the segment is full.
    pub fn remaining_offsets(&self) -> u64 {
        (self.descriptor.range - i64::from(self.index.next_offset())).max(0) as u64
    }

    /// Remove every entry with index greater than `keep_through`.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the segment is sealed.
    pub fn truncate_to(&mut self, keep_through: Index) -> Result<()> {
        if keep_through >= self.last_index() {
            return Ok(());
        }
        let SegmentState::Active { data, .. } = &self.state else {
            return Err(Error::Storage("truncate on a sealed segment".into()));
        };

        if keep_through < self.first_index() {
            return Err(Error::Storage(format!(
                "truncate to {keep_through} below segment first index {}",
                self.first_index()
            )));
        }
        self.index.truncate((keep_through - self.first_index()) as u32);

        self.size = match self.index.last_entry() {
            Some((_, position)) => {
                u64::from(position) + u64::from(read_u32_at(data, u64::from(position))?)
            }
            None => DESCRIPTOR_LEN as u64,
        };
        data.set_len(self.size)?;
        data.sync_all()?;
        self.commit_index = self.commit_index.min(self.last_index());
        self.rewrite_index_file()
    }

    /// Raise the commit watermark. A sealed, fully committed segment locks
    /// its descriptor, which is what recovery's version arbitration reads.
    pub fn commit(&mut self, index: Index) -> Result<()> {
        let watermark = index.min(self.last_index());
        if watermark > self.commit_index {
            self.commit_index = watermark;
        }
        if !self.is_active()
            && !self.is_empty()
            && self.commit_index == self.last_index()
            && !self.descriptor.locked
        {
            self.lock()?;
        }
        Ok(())
    }

    /// Flip the descriptor's locked flag on disk.
    fn lock(&mut self) -> Result<()> {
        self.descriptor.locked = true;
        let file = OpenOptions::new().write(true).open(&self.data_path)?;
        file.write_all_at(&self.descriptor.encode(), 0)?;
        file.sync_all()?;
        debug!("locked segment {}", self.data_path.display());
        Ok(())
    }

    /// Flush and close the write path, reopening the data as a read-only
    /// map. Locks the descriptor if everything here is already committed.
    pub fn seal(&mut self) -> Result<()> {
        if let SegmentState::Active { data, .. } = &self.state {
            data.sync_all()?;
            self.rewrite_index_file()?;
            self.state = SegmentState::Sealed {
                map: Mapped::open(&self.data_path)?,
            };
            if !self.is_empty() && self.commit_index == self.last_index() && !self.descriptor.locked
            {
                self.lock()?;
            }
        }
        Ok(())
    }

    /// Reopen the write path of a sealed segment; used when a truncation
    /// lands inside it.
    pub fn unseal(&mut self) -> Result<()> {
        if let SegmentState::Sealed { .. } = self.state {
            let data = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.data_path)?;
            let index_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.index_path)?;
            self.state = SegmentState::Active { data, index_file };
        }
        Ok(())
    }

    /// Flush pending data to disk.
    pub fn sync(&self) -> Result<()> {
        if let SegmentState::Active { data, .. } = &self.state {
            data.sync_data()?;
        }
        Ok(())
    }

    /// Persist the in-memory index and close out buffered state.
    pub fn close(&mut self) -> Result<()> {
        if self.is_active() {
            self.sync()?;
            self.rewrite_index_file()?;
        }
        Ok(())
    }

    /// Remove the segment's files.
    pub fn delete(self) -> Result<()> {
        debug!("deleting segment {}", self.data_path.display());
        fs::remove_file(&self.data_path)?;
        match fs::remove_file(&self.index_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Iterate present entries in offset order.
    pub fn entries<'a>(
        &'a self,
        scratch: &'a mut Buffer,
    ) -> impl Iterator<Item = Result<Entry>> + 'a {
        let first = self.first_index();
        let offsets: Vec<u32> = self.index.iter().map(|(o, _)| o).collect();
        offsets.into_iter().map(move |offset| {
            self.get(first + u64::from(offset), &mut *scratch)?
                .ok_or_else(|| {
                    Error::Corruption(format!("indexed entry at offset {offset} unreadable"))
                })
        })
    }

    /// Rewrite the full index file through a temp file and rename, then
    /// reopen the live handle.
    fn rewrite_index_file(&mut self) -> Result<()> {
        let tmp = self.index_path.with_extension("index.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.index.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.index_path)?;
        if let SegmentState::Active { index_file, .. } = &mut self.state {
            *index_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.index_path)?;
        }
        Ok(())
    }

    /// Write one incremental index record after an append.
    fn write_index_record(&mut self, slot: usize, offset: u32, position: u32) -> Result<()> {
        let dense = self.index.is_dense();
        let SegmentState::Active { index_file, .. } = &self.state else {
            return Err(Error::Storage("index write on a sealed segment".into()));
        };
        if dense {
            index_file.write_all_at(
                &position.to_le_bytes(),
                (INDEX_HEADER_LEN + slot * 4) as u64,
            )?;
        } else {
            let mut record = [0u8; 8];
            record[..4].copy_from_slice(&offset.to_le_bytes());
            record[4..].copy_from_slice(&position.to_le_bytes());
            index_file.write_all_at(&record, (INDEX_HEADER_LEN + slot * 8) as u64)?;
        }
        Ok(())
    }
}

/// Sequentially scan record positions from a data file; stops at a zero
/// length word, a malformed record, or the end of the file.
fn scan_positions(data: &File, data_len: u64) -> Result<Vec<u32>> {
    let mut positions = Vec::new();
    let mut position = DESCRIPTOR_LEN as u64;
    while position + 4 <= data_len {
        let length = u64::from(read_u32_at(data, position)?);
        if length == 0 {
            break;
        }
        if length < MIN_RECORD_LEN as u64 || position + length > data_len {
            debug!("partial record at position {position}, stopping scan");
            break;
        }
        positions.push(position as u32);
        position += length;
    }
    Ok(positions)
}

fn read_u32_at(file: &File, position: u64) -> Result<u32> {
    let mut bytes = [0u8; 4];
    file.read_exact_at(&mut bytes, position)?;
    Ok(u32::from_le_bytes(bytes))
}
