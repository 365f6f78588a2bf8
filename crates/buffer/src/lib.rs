//! Byte regions and cursors for the segmented log's hot path.
//!
//! A [`Buffer`] is a bounded heap region with a *limit* (bytes filled so far)
//! and a fixed *capacity*. Cheap [`ReadCursor`] / [`WriteCursor`] views borrow
//! from the region and carry their own positions, so the region itself stays
//! pinned while any number of cursors come and go. [`Mapped`] is the
//! file-backed flavor: a read-only memory map exposing the same cursor API.
//!
//! [`BufferPool`] recycles scratch regions for encode/decode work so the
//! append path does not allocate per entry. Acquiring hands out a cleared
//! region; dropping the handle returns it to a lock-free free list.

#[cfg(test)]
mod tests;

use common::{Error, Result};
use crossbeam::queue::SegQueue;
use memmap2::Mmap;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

fn underflow(wanted: usize, available: usize) -> Error {
    Error::Buffer(format!("read of {wanted} bytes exceeds {available} available"))
}

fn overflow(wanted: usize, available: usize) -> Error {
    Error::Buffer(format!("write of {wanted} bytes exceeds {available} remaining"))
}

/// A bounded heap byte region.
///
/// The `limit` marks how many bytes have been filled; the capacity is fixed
/// at construction. Writers may only extend up to the capacity.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    limit: usize,
}

impl Buffer {
    /// Allocate a zeroed region of the given capacity with limit 0.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            limit: 0,
        }
    }

    /// Wrap an existing vector; the limit is the vector length.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let limit = data.len();
        Self {
            data: data.into_boxed_slice(),
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Reset the limit to zero, recycling the region.
    pub fn clear(&mut self) {
        self.limit = 0;
    }

    /// The filled prefix of the region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.limit]
    }

    /// Mutable access to the full capacity, for filling via positioned I/O.
    /// The caller must `set_limit` afterwards to publish the filled length.
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Publish a filled length.
    ///
    /// # Errors
    ///
    /// Returns `Error::Buffer` if `limit` exceeds the capacity.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.data.len() {
            return Err(overflow(limit, self.data.len()));
        }
        self.limit = limit;
        Ok(())
    }

    /// A read cursor over the filled prefix, starting at position 0.
    pub fn reader(&self) -> ReadCursor<'_> {
        ReadCursor::new(self.as_slice())
    }

    /// A read cursor starting at `pos`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Buffer` if `pos` is past the limit.
    pub fn reader_at(&self, pos: usize) -> Result<ReadCursor<'_>> {
        if pos > self.limit {
            return Err(underflow(pos, self.limit));
        }
        Ok(ReadCursor {
            data: self.as_slice(),
            pos,
        })
    }

    /// A write cursor appending at the current limit.
    pub fn writer(&mut self) -> WriteCursor<'_> {
        let pos = self.limit;
        WriteCursor { buf: self, pos }
    }

    /// A write cursor positioned at `pos`, for in-place header rewrites.
    ///
    /// # Errors
    ///
    /// Returns `Error::Buffer` if `pos` is past the capacity.
    pub fn writer_at(&mut self, pos: usize) -> Result<WriteCursor<'_>> {
        if pos > self.data.len() {
            return Err(overflow(pos, self.data.len()));
        }
        Ok(WriteCursor { buf: self, pos })
    }
}

/// A borrowing read view with its own position.
#[derive(Clone, Debug)]
pub struct ReadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(underflow(n, self.remaining()));
        }
        self.pos += n;
        Ok(())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(underflow(n, self.remaining()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.get_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.get_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let bytes = self.get_bytes(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// LEB128 variable-length unsigned integer.
    pub fn get_var_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_u8()?;
            if shift >= 64 {
                return Err(Error::Buffer("varint longer than 10 bytes".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }
}

/// A borrowing write view appending into a [`Buffer`].
///
/// Each put advances the buffer's limit to cover the written bytes.
#[derive(Debug)]
pub struct WriteCursor<'a> {
    buf: &'a mut Buffer,
    pos: usize,
}

impl WriteCursor<'_> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.data.len() {
            return Err(overflow(bytes.len(), self.buf.data.len() - self.pos));
        }
        self.buf.data[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        if end > self.buf.limit {
            self.buf.limit = end;
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_bytes(&[value])
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// LEB128 variable-length unsigned integer.
    pub fn put_var_u64(&mut self, mut value: u64) -> Result<()> {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                return self.put_u8(byte);
            }
            self.put_u8(byte | 0x80)?;
        }
    }
}

/// Number of bytes `put_var_u64` uses for `value`.
pub fn var_u64_len(value: u64) -> usize {
    let bits = 64 - value.max(1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// A read-only memory-mapped file region with the cursor API of [`Buffer`].
#[derive(Debug)]
pub struct Mapped {
    map: Mmap,
}

impl Mapped {
    /// Map the file at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be opened or
    /// mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // Safety: the map is read-only and the segment owns its file
        // exclusively, so the underlying bytes cannot change beneath us.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// A read cursor starting at `pos`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Buffer` if `pos` is past the end of the map.
    pub fn reader_at(&self, pos: usize) -> Result<ReadCursor<'_>> {
        if pos > self.map.len() {
            return Err(underflow(pos, self.map.len()));
        }
        Ok(ReadCursor {
            data: &self.map,
            pos,
        })
    }
}

struct PoolInner {
    free: SegQueue<Buffer>,
    buffer_capacity: usize,
}

/// A thread-safe pool of recycled scratch [`Buffer`]s.
///
/// `acquire` pops a cleared region from the lock-free free list, or allocates
/// a fresh one when the list is empty. Dropping the returned handle puts the
/// region back.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool whose buffers hold `buffer_capacity` bytes each.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: SegQueue::new(),
                buffer_capacity,
            }),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Number of idle buffers on the free list.
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    /// Take a cleared buffer out of the pool.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| Buffer::with_capacity(self.inner.buffer_capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A pooled scratch buffer; returns to the pool's free list on drop.
pub struct PooledBuffer {
    buf: Option<Buffer>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.free.push(buf);
        }
    }
}
