//! The segmented, append-only replicated log.
//!
//! The log stores a totally ordered sequence of entries, indexed by a
//! contiguous 1-based `index`, across an ordered collection of segments.
//! Each segment is a pair of files: a data file carrying a fixed 64-byte
//! descriptor followed by length-framed entry records, and an offset index
//! file mapping entry offsets to byte positions.
//!
//! The log upholds the following invariants:
//!
//! * Entry indexes are contiguous starting at 1; `skip` records holes inside
//!   a segment but never moves the boundaries out of step.
//! * Segments tile the index space: each segment starts at the previous
//!   segment's last index plus one.
//! * Entry terms never decrease from the previous entry.
//! * Committed entries are never changed or removed; truncation below the
//!   commit watermark is refused.
//! * A segment's descriptor is locked once every entry in it is committed,
//!   which is what recovery uses to arbitrate between compaction versions.
//!
//! Appends go to the single active segment at the tail. When the active
//! segment can no longer hold a maximum-size entry it is sealed (reopened as
//! a read-only map) and a new segment begins at the next index. Compaction
//! rewrites one locked segment into a higher-version replacement holding a
//! retained subset of its entries, then atomically swaps it in.

pub mod descriptor;
pub mod entry;
pub mod index;
pub mod segment;


pub use descriptor::{DESCRIPTOR_LEN, SegmentDescriptor};
pub use entry::{Entry, EntryKind};
pub use index::OffsetIndex;
pub use segment::{Segment, data_file_name, index_file_name};

use buffer::BufferPool;
use common::{Config, Error, Index, Result, Term};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Manager of the ordered collection of segments.
pub struct SegmentedLog {
    directory: PathBuf,
    name: String,
    max_entry_size: usize,
    max_segment_size: usize,
    max_entries_per_segment: usize,
    /// Keyed by first index; the last segment is the active one.
    segments: BTreeMap<Index, Segment>,
    commit_index: Index,
    pool: BufferPool,
}

impl SegmentedLog {
    /// Open the log, recovering any segments already on disk.
    ///
    /// Recovery enumerates `{name}-{id}-{version}.log` files, keeps the
    /// winning version of each segment id (the highest locked version, or
    /// the highest version when none is locked), deletes superseded files,
    /// and validates that the survivors tile the index space from 1 without
    /// gaps. A violated tiling is fatal corruption.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        if config.max_segment_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_segment_size {} exceeds the u32 position space",
                config.max_segment_size
            )));
        }
        fs::create_dir_all(&config.directory)?;

        let mut found: HashMap<u64, Vec<SegmentDescriptor>> = HashMap::new();
        for dir_entry in fs::read_dir(&config.directory)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some((id, version)) = parse_segment_file_name(&config.name, &file_name) else {
                continue;
            };

            let mut header = [0u8; DESCRIPTOR_LEN];
            let file = File::open(dir_entry.path())?;
            file.read_exact_at(&mut header, 0).map_err(|e| {
                Error::Corruption(format!("unreadable header in {file_name}: {e}"))
            })?;
            let desc = SegmentDescriptor::decode(&header)?;
            if desc.id != id || desc.version != version {
                return Err(Error::Corruption(format!(
                    "descriptor {}-{} disagrees with filename {file_name}",
                    desc.id, desc.version
                )));
            }
            found.entry(id).or_default().push(desc);
        }

        let mut winners = Vec::new();
        for (id, mut versions) in found {
            versions.sort_by_key(|d| d.version);
            let Some(&highest) = versions.last() else {
                continue;
            };
            let winner = versions
                .iter()
                .rev()
                .find(|d| d.locked)
                .copied()
                .unwrap_or(highest);
            for loser in versions.iter().filter(|d| d.version != winner.version) {
                warn!(
                    "discarding superseded segment {}-{:05}-{:03}",
                    config.name, id, loser.version
                );
                remove_segment_files(&config.directory, &config.name, id, loser.version)?;
            }
            winners.push(winner);
        }
        winners.sort_by_key(|d| d.index);

        let mut segments = BTreeMap::new();
        let count = winners.len();
        for (i, desc) in winners.iter().enumerate() {
            let active = i + 1 == count && !desc.locked;
            let seg = Segment::open(&config.directory, &config.name, *desc, active)?;
            segments.insert(seg.first_index(), seg);
        }

        let mut expected: Index = 1;
        for (i, seg) in segments.values().enumerate() {
            if seg.first_index() != expected {
                return Err(Error::Corruption(format!(
                    "segment {} starts at index {} where {} was expected",
                    seg.descriptor().id,
                    seg.first_index(),
                    expected
                )));
            }
            if seg.is_empty() && i + 1 != count {
                return Err(Error::Corruption(format!(
                    "empty segment {} in the middle of the log",
                    seg.descriptor().id
                )));
            }
            expected = seg.last_index() + 1;
        }

        let mut log = Self {
            directory: config.directory.clone(),
            name: config.name.clone(),
            max_entry_size: config.max_entry_size,
            max_segment_size: config.max_segment_size,
            max_entries_per_segment: config.max_entries_per_segment,
            segments,
            commit_index: 0,
            pool: BufferPool::new(config.max_entry_size.max(DESCRIPTOR_LEN)),
        };

        let needs_tail = match log.segments.values().next_back() {
            None => true,
            Some(seg) => !seg.is_active(),
        };
        if needs_tail {
            let (id, index) = log
                .segments
                .values()
                .next_back()
                .map(|s| (s.descriptor().id + 1, s.last_index() + 1))
                .unwrap_or((1, 1));
            let seg = Segment::create(&log.directory, &log.name, log.descriptor_for(id, index))?;
            log.segments.insert(index, seg);
        }

        for seg in log.segments.values() {
            if seg.is_locked() {
                log.commit_index = seg.last_index();
            } else {
                break;
            }
        }

        info!(
            "opened log {} with {} segments, last index {}, commit index {}",
            log.name,
            log.segments.len(),
            log.last_index(),
            log.commit_index
        );
        Ok(log)
    }

    fn descriptor_for(&self, id: u64, index: Index) -> SegmentDescriptor {
        SegmentDescriptor {
            id,
            version: 1,
            index,
            range: self.max_entries_per_segment as i64,
            max_entry_size: self.max_entry_size as u32,
            max_segment_size: self.max_segment_size as u32,
            locked: false,
        }
    }

    /// First index of the log, always 1.
    pub fn first_index(&self) -> Index {
        self.segments
            .values()
            .next()
            .map(|s| s.first_index())
            .unwrap_or(1)
    }

    /// Last index of the log, including skipped offsets; 0 while empty.
    pub fn last_index(&self) -> Index {
        self.segments
            .values()
            .next_back()
            .map(|s| s.last_index())
            .unwrap_or(0)
    }

    /// Index the next append will occupy.
    pub fn next_index(&self) -> Index {
        self.last_index() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    /// Highest committed index.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Descriptors of the live segments, in index order.
    pub fn segment_descriptors(&self) -> Vec<SegmentDescriptor> {
        self.segments.values().map(|s| *s.descriptor()).collect()
    }

    /// Whether `index` falls inside the log's logical range. The entry
    /// itself may still be absent if the index was skipped or compacted
    /// away; `get` distinguishes.
    pub fn contains_index(&self, index: Index) -> bool {
        index >= self.first_index() && index <= self.last_index() && !self.is_empty()
    }

    fn active(&self) -> &Segment {
        self.segments
            .values()
            .next_back()
            .expect("the log always has a tail segment")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments
            .values_mut()
            .next_back()
            .expect("the log always has a tail segment")
    }

    /// Append a new entry at the next index.
    pub fn append(
        &mut self,
        term: Term,
        kind: EntryKind,
        key: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<Index> {
        let entry = Entry::new(self.next_index(), term, kind, key, payload);
        self.append_entry(entry)
    }

    /// Append an entry received from a leader; its index must be the next
    /// index.
    ///
    /// # Errors
    ///
    /// `Error::Storage` on an out-of-sequence index or an oversized record.
    pub fn append_entry(&mut self, entry: Entry) -> Result<Index> {
        let record_len = entry.record_len();
        if record_len > self.max_entry_size {
            return Err(Error::Storage(format!(
                "entry record of {record_len} bytes exceeds max_entry_size {}",
                self.max_entry_size
            )));
        }
        if entry.index != self.next_index() {
            return Err(Error::Storage(format!(
                "append of index {} out of sequence, expected {}",
                entry.index,
                self.next_index()
            )));
        }

        // Rotate once the active segment can no longer hold a maximum-size
        // entry, so mid-batch rotation never splits a record.
        let needs_roll = {
            let active = self.active();
            !active.is_empty()
                && !(active.has_room(self.max_entry_size) && active.has_room(record_len))
        };
        if needs_roll {
            self.roll()?;
        }

        let mut scratch = self.pool.acquire();
        self.active_mut().append(&entry, &mut scratch)
    }

    /// Seal the active segment and begin a fresh one at the next index.
    fn roll(&mut self) -> Result<()> {
        let (id, index) = {
            let active = self.active_mut();
            active.seal()?;
            (active.descriptor().id + 1, active.last_index() + 1)
        };
        debug!("rolling to segment {id} at index {index}");
        let seg = Segment::create(&self.directory, &self.name, self.descriptor_for(id, index))?;
        self.segments.insert(index, seg);
        Ok(())
    }

    /// Read the entry at `index`; `None` when the index is out of range,
    /// was skipped, or was compacted away.
    pub fn get(&self, index: Index) -> Result<Option<Entry>> {
        let Some(seg) = self.segment_containing(index) else {
            return Ok(None);
        };
        let mut scratch = self.pool.acquire();
        seg.get(index, &mut scratch)
    }

    /// Term of the entry at `index`, if present.
    pub fn term_of(&self, index: Index) -> Result<Option<Term>> {
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Collect present entries in `[from, to]`, stopping before `max_bytes`
    /// or `max_entries` would be exceeded (always yielding at least one
    /// entry when any is present).
    pub fn entries(
        &self,
        from: Index,
        to: Index,
        max_bytes: usize,
        max_entries: usize,
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let to = to.min(self.last_index());
        for index in from..=to {
            let Some(entry) = self.get(index)? else {
                continue;
            };
            let len = entry.record_len();
            if !out.is_empty() && (bytes + len > max_bytes || out.len() >= max_entries) {
                break;
            }
            bytes += len;
            out.push(entry);
        }
        Ok(out)
    }

    fn segment_containing(&self, index: Index) -> Option<&Segment> {
        self.segments
            .range(..=index)
            .next_back()
            .map(|(_, seg)| seg)
            .filter(|seg| seg.contains(index))
    }

    /// Advance the expected next index by `n`, recording a gap.
    pub fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            let (remaining, sealed) = {
                let active = self.active();
                (active.remaining_offsets(), !active.is_active())
            };
            if sealed || remaining == 0 {
                self.roll()?;
                continue;
            }
            let step = n.min(remaining);
            self.active_mut().skip(step)?;
            n -= step;
        }
        Ok(())
    }

    /// Remove every entry with index greater than `keep_through`. Whole
    /// segments above the cut are deleted; the containing segment is
    /// reopened for appends.
    ///
    /// # Errors
    ///
    /// `Error::Storage` when truncating below the log's first index or below
    /// the commit watermark.
    pub fn truncate(&mut self, keep_through: Index) -> Result<()> {
        if keep_through >= self.last_index() {
            return Ok(());
        }
        if keep_through < self.first_index() {
            return Err(Error::Storage(format!(
                "cannot truncate to {keep_through}, before the log's first index"
            )));
        }
        if keep_through < self.commit_index {
            return Err(Error::Storage(format!(
                "cannot truncate to {keep_through} below the commit index {}",
                self.commit_index
            )));
        }

        let doomed: Vec<Index> = self
            .segments
            .range(keep_through + 1..)
            .map(|(&first, _)| first)
            .collect();
        for first in doomed {
            if let Some(seg) = self.segments.remove(&first) {
                seg.delete()?;
            }
        }

        let tail = self.active_mut();
        if keep_through < tail.last_index() {
            tail.unseal()?;
            tail.truncate_to(keep_through)?;
        } else {
            // The cut landed exactly on this segment's boundary; reopen it
            // for appends unless it is already immutable.
            if !tail.is_locked() {
                tail.unseal()?;
            }
        }
        Ok(())
    }

    /// Advance the commit watermark to `index`, cascading backwards so every
    /// earlier segment becomes fully committed (and locks once sealed).
    ///
    /// # Errors
    ///
    /// `Error::Storage` when committing past the last index.
    pub fn commit(&mut self, index: Index) -> Result<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        if index > self.last_index() {
            return Err(Error::Storage(format!(
                "cannot commit {index} past the last index {}",
                self.last_index()
            )));
        }
        self.commit_index = index;

        let containing_first = self
            .segments
            .range(..=index)
            .next_back()
            .map(|(&first, _)| first)
            .ok_or_else(|| Error::Storage(format!("no segment contains index {index}")))?;

        for (_, seg) in self.segments.range_mut(..=containing_first).rev() {
            let fully = seg.commit_index() >= seg.last_index() && seg.is_locked();
            if fully {
                break;
            }
            let target = if seg.first_index() == containing_first {
                index
            } else {
                seg.last_index()
            };
            seg.commit(target)?;
        }
        Ok(())
    }

    /// Rewrite the locked segment starting at `first` into a higher-version
    /// replacement holding only the entries `retain` keeps, then atomically
    /// swap it in and delete the old files.
    ///
    /// # Errors
    ///
    /// `Error::Storage` when no such segment exists or it is not yet fully
    /// committed.
    pub fn compact<F>(&mut self, first: Index, retain: F) -> Result<()>
    where
        F: Fn(&Entry) -> bool,
    {
        let new_desc = {
            let Some(seg) = self.segments.get(&first) else {
                return Err(Error::Storage(format!("no segment starts at index {first}")));
            };
            if !seg.is_locked() {
                return Err(Error::Storage(format!(
                    "segment {} is not fully committed, cannot compact",
                    seg.descriptor().id
                )));
            }
            let mut desc = *seg.descriptor();
            desc.version += 1;
            desc.locked = false;
            desc
        };

        let mut replacement = Segment::create(&self.directory, &self.name, new_desc)?;
        {
            let seg = &self.segments[&first];
            let mut read_scratch = self.pool.acquire();
            let mut write_scratch = self.pool.acquire();
            let mut kept = 0usize;
            for result in seg.entries(&mut read_scratch) {
                let entry = result?;
                if retain(&entry) {
                    replacement.append_at(
                        (entry.index - first) as u32,
                        &entry,
                        &mut write_scratch,
                    )?;
                    kept += 1;
                }
            }
            let delta = seg.last_index() - replacement.last_index();
            if delta > 0 {
                replacement.skip(delta)?;
            }
            replacement.commit(seg.last_index())?;
            info!(
                "compacted segment {} to version {}: kept {kept} of {} entries",
                new_desc.id,
                new_desc.version,
                seg.entry_count()
            );
        }
        // Data and index hit disk before the descriptor locks, so a crash
        // leaves an unlocked replacement that recovery discards in favor of
        // the old locked version.
        replacement.seal()?;

        let old = self
            .segments
            .remove(&first)
            .ok_or_else(|| Error::Storage(format!("segment at {first} vanished")))?;
        old.delete()?;
        self.segments.insert(first, replacement);
        Ok(())
    }

    /// Flush the active segment's appends to disk.
    pub fn sync(&self) -> Result<()> {
        self.active().sync()
    }

    /// Flush everything and close the log.
    pub fn close(mut self) -> Result<()> {
        for seg in self.segments.values_mut() {
            seg.close()?;
        }
        Ok(())
    }

    /// Close the log and remove every file it owns.
    pub fn delete(self) -> Result<()> {
        for (_, seg) in self.segments {
            seg.delete()?;
        }
        Ok(())
    }
}

/// Parse `{name}-{id}-{version}.log` into `(id, version)`.
fn parse_segment_file_name(name: &str, file_name: &str) -> Option<(u64, u64)> {
    let rest = file_name.strip_prefix(name)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".log")?;
    let (id_str, version_str) = rest.split_once('-')?;
    if !id_str.bytes().all(|b| b.is_ascii_digit())
        || !version_str.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((id_str.parse().ok()?, version_str.parse().ok()?))
}

fn remove_segment_files(directory: &PathBuf, name: &str, id: u64, version: u64) -> Result<()> {
    fs::remove_file(directory.join(data_file_name(name, id, version)))?;
    match fs::remove_file(directory.join(index_file_name(name, id, version))) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
