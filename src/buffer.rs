//! # Seekable Memory Buffer
//!
//! A growable, position-addressable byte store used for staging entries in memory.
//!
//! Storage is a list of blocks instead of one contiguous `Vec<u8>`: when the buffer
//! runs out of room a new block is appended and nothing already written is ever copied
//! or reallocated. Each new block doubles the previous growth size, up to 16x the
//! starting growth size, which bounds both the total copy cost (zero) and the largest
//! single allocation (1 GiB).
//!
//! Blocks are reference counted and copy-on-write, so [`SeekableMemoryBuffer::copy`]
//! is O(1): a compression worker can hand a snapshot of its output to the archive
//! writer and keep reusing its own buffer.
//!
//! The buffer implements [`Read`], [`Write`] and [`Seek`], which makes it a drop-in
//! backing store for `zip::ZipWriter`, `zip::ZipArchive` and `tar::Builder`.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use thiserror::Error;

/// Default first block when no capacity is requested.
const DEFAULT_INITIAL_CAPACITY: usize = 10 * 1024 * 1024; // 10 MiB
/// Growth blocks are never smaller than this...
const MIN_GROWTH_BLOCK: usize = 1024 * 1024; // 1 MiB
/// ...and start no larger than this.
const MAX_INITIAL_GROWTH_BLOCK: usize = 64 * 1024 * 1024; // 64 MiB
/// Growth blocks double until they reach this multiple of the first growth block.
const GROWTH_CAP_FACTOR: usize = 16;

/// Errors raised by [`SeekableMemoryBuffer`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// A position or size outside `0..=size`.
    #[error("position {requested} is out of range 0..={size}")]
    OutOfBounds { requested: u64, size: u64 },
    /// The buffer was closed (and is closeable).
    #[error("buffer is closed")]
    Closed,
}

impl From<BufferError> for io::Error {
    fn from(err: BufferError) -> Self {
        let kind = match err {
            BufferError::OutOfBounds { .. } => io::ErrorKind::InvalidInput,
            BufferError::Closed => io::ErrorKind::BrokenPipe,
        };
        io::Error::new(kind, err)
    }
}

/// Growable in-memory byte store that never copies data it already holds.
///
/// Not thread-safe by itself; move it between threads or wrap it in a lock.
#[derive(Debug)]
pub struct SeekableMemoryBuffer {
    blocks: Vec<Arc<Vec<u8>>>,
    /// Absolute offset of the first byte of each block.
    starts: Vec<usize>,
    size: usize,
    position: usize,
    /// Index of the block holding `position` (cached between calls).
    cur: usize,
    next_block: usize,
    max_block: usize,
    closed: bool,
    closeable: bool,
}

impl SeekableMemoryBuffer {
    /// Creates an empty buffer with a 10 MiB first block.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    /// Creates an empty buffer whose first block holds `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::init(vec![0u8; capacity], 0)
    }

    /// Wraps existing data; the buffer size is the length of `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let size = data.len();
        Self::init(data, size)
    }

    /// Wraps a pre-allocated vector of which only the first `size` bytes are data.
    pub fn from_vec_with_size(data: Vec<u8>, size: usize) -> Result<Self, BufferError> {
        if size > data.len() {
            return Err(BufferError::OutOfBounds { requested: size as u64, size: data.len() as u64 });
        }
        Ok(Self::init(data, size))
    }

    fn init(first: Vec<u8>, size: usize) -> Self {
        let growth = first.len().clamp(MIN_GROWTH_BLOCK, MAX_INITIAL_GROWTH_BLOCK);
        Self {
            blocks: vec![Arc::new(first)],
            starts: vec![0],
            size,
            position: 0,
            cur: 0,
            next_block: growth,
            max_block: growth * GROWTH_CAP_FACTOR,
            closed: false,
            closeable: true,
        }
    }

    /// Number of bytes of data held.
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current read/write position.
    ///
    /// Still answers after `close()`, reporting the position at close time.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Total bytes allocated across all blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Moves the position to `pos`, which must not exceed `size()`.
    pub fn set_position(&mut self, pos: u64) -> Result<(), BufferError> {
        self.ensure_open()?;
        if pos > self.size as u64 {
            return Err(BufferError::OutOfBounds { requested: pos, size: self.size as u64 });
        }
        self.relocate(pos as usize);
        Ok(())
    }

    /// Shrinks the data to `len` bytes, clamping the position if needed.
    ///
    /// Blocks are kept, so refilling a truncated buffer allocates nothing.
    /// Truncating to a length at or beyond `size()` changes nothing.
    pub fn truncate(&mut self, len: u64) {
        if (len as usize) < self.size {
            self.size = len as usize;
        }
        if self.position > self.size {
            self.relocate(self.size);
        }
    }

    /// Returns the data as one contiguous slice of exactly `size()` bytes.
    ///
    /// With more than one block in use this concatenates them (O(size)) and then
    /// re-initialises the buffer around the single combined block, so repeated calls
    /// are free. The position and growth state are kept.
    pub fn array(&mut self) -> &[u8] {
        if self.size > self.blocks[0].len() {
            let mut combined = Vec::with_capacity(self.size);
            for block in &self.blocks {
                let remaining = self.size - combined.len();
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(block.len());
                combined.extend_from_slice(&block[..take]);
            }
            tracing::debug!(blocks = self.blocks.len(), size = self.size, "consolidating memory buffer");
            self.blocks = vec![Arc::new(combined)];
            self.starts = vec![0];
            self.cur = 0;
            let pos = self.position;
            self.relocate(pos);
        }
        &self.blocks[0][..self.size]
    }

    /// Copies the data out into a new vector without touching the buffer layout.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for block in &self.blocks {
            let remaining = self.size - out.len();
            if remaining == 0 {
                break;
            }
            out.extend_from_slice(&block[..remaining.min(block.len())]);
        }
        out
    }

    /// Returns an independent buffer sharing the current blocks.
    ///
    /// The copy owns its own size, position and open state. Blocks are copy-on-write:
    /// a later write to either buffer duplicates only the block it touches.
    pub fn copy(&self) -> Self {
        Self {
            blocks: self.blocks.clone(),
            starts: self.starts.clone(),
            size: self.size,
            position: self.position,
            cur: self.cur,
            next_block: self.next_block,
            max_block: self.max_block,
            closed: false,
            closeable: self.closeable,
        }
    }

    /// Closes the buffer if it is closeable; otherwise does nothing.
    pub fn close(&mut self) {
        if self.closeable {
            self.closed = true;
        }
    }

    /// Re-opens a closed buffer for reuse.
    pub fn reopen(&mut self) {
        self.closed = false;
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Pool-owned buffers turn this off so that a wrapping stream's close is ignored.
    pub fn set_closeable(&mut self, closeable: bool) {
        self.closeable = closeable;
    }

    pub fn is_closeable(&self) -> bool {
        self.closeable
    }

    fn ensure_open(&self) -> Result<(), BufferError> {
        if self.closed {
            Err(BufferError::Closed)
        } else {
            Ok(())
        }
    }

    /// Points `cur` at the block holding `pos`, scanning from the cached block.
    fn relocate(&mut self, pos: usize) {
        if pos == 0 {
            self.cur = 0;
        } else if pos < self.starts[self.cur] {
            while pos < self.starts[self.cur] {
                self.cur -= 1;
            }
        } else {
            while self.cur + 1 < self.blocks.len() && pos >= self.block_end(self.cur) {
                self.cur += 1;
            }
        }
        self.position = pos;
    }

    fn block_end(&self, idx: usize) -> usize {
        self.starts[idx] + self.blocks[idx].len()
    }

    /// Makes sure the current block has room at `position`, appending a block if the
    /// position sits at the end of the last one.
    fn ensure_room(&mut self) {
        while self.position >= self.block_end(self.cur) {
            if self.cur + 1 < self.blocks.len() {
                self.cur += 1;
            } else {
                self.grow();
            }
        }
    }

    fn grow(&mut self) {
        let start = self.block_end(self.blocks.len() - 1);
        tracing::trace!(block = self.blocks.len(), len = self.next_block, start, "appending buffer block");
        self.blocks.push(Arc::new(vec![0u8; self.next_block]));
        self.starts.push(start);
        self.cur = self.blocks.len() - 1;
        self.next_block = (self.next_block * 2).min(self.max_block);
    }
}

impl Default for SeekableMemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for SeekableMemoryBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let wanted = buf.len().min(self.size - self.position);
        let mut done = 0;
        while done < wanted {
            let off = self.position - self.starts[self.cur];
            let block = &self.blocks[self.cur];
            let n = (wanted - done).min(block.len() - off);
            if n == 0 {
                // Only possible on an empty block before the data continues.
                self.cur += 1;
                continue;
            }
            buf[done..done + n].copy_from_slice(&block[off..off + n]);
            done += n;
            self.relocate(self.position + n);
        }
        Ok(done)
    }
}

impl Write for SeekableMemoryBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let mut done = 0;
        while done < buf.len() {
            self.ensure_room();
            let off = self.position - self.starts[self.cur];
            let block = Arc::make_mut(&mut self.blocks[self.cur]);
            let n = (buf.len() - done).min(block.len() - off);
            block[off..off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            self.relocate(self.position + n);
            self.size = self.size.max(self.position);
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SeekableMemoryBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(off) => (self.size as u64).checked_add_signed(off),
            SeekFrom::Current(off) => (self.position as u64).checked_add_signed(off),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative or overflowing position")
        })?;
        self.set_position(target)?;
        Ok(target)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position as u64)
    }
}
