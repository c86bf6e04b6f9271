//! Payload: the buffer descriptor that travels through buses and ports.
//!
//! A [`Payload`] carries a backing buffer plus the bookkeeping every stage
//! needs: how many bytes are valid, whether this is the final chunk of the
//! stream, and a presentation timestamp.
//!
//! # Storage
//!
//! The backing buffer is one of:
//!
//! - **Owned**: allocated by [`Payload::with_len`] or
//!   [`Payload::realloc_aligned`] and freed when the payload drops.
//! - **Lent**: a node buffer on loan from a pointer buffer or FIFO. It must be
//!   handed back through the matching `release_*` call.
//! - **Region**: a window into a block buffer arena. Access locks the arena
//!   for as long as the returned guard lives, so no bytes are copied.
//!
//! Only owned storage counts towards [`owns_buffer`](Payload::owns_buffer);
//! the other two belong to the bus that lent them and are returned exactly once.
//!
//! ```rust
//! use gmf_core::Payload;
//!
//! let mut load = Payload::with_len(8).unwrap();
//! load.fill_from(&[1, 2, 3]).unwrap();
//! assert_eq!(&*load.data(), &[1, 2, 3]);
//! assert!(load.owns_buffer());
//! ```

use std::ops::{Deref, DerefMut, Range};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{Error, Result, try_alloc};

/// Shared arena of a block buffer.
pub(crate) type Arena = Arc<Mutex<Box<[u8]>>>;

/// A node buffer lent out by a list-based bus.
#[derive(Debug)]
pub(crate) struct Loan {
    /// Identity of the lending bus.
    pub(crate) bus: u64,
    /// Identity of the node within that bus.
    pub(crate) node: u64,
    pub(crate) buf: Vec<u8>,
}

/// A window into a block buffer arena.
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub(crate) arena: Arena,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

#[derive(Debug, Default)]
enum Storage {
    #[default]
    Empty,
    Owned(Vec<u8>),
    Lent(Loan),
    Region(Region),
}

/// Read access to payload bytes.
pub enum BufRef<'a> {
    /// Plain slice of owned or lent storage.
    Slice(&'a [u8]),
    /// Locked window into a block buffer arena.
    Arena(MappedMutexGuard<'a, [u8]>),
}

impl Deref for BufRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BufRef::Slice(s) => s,
            BufRef::Arena(g) => g,
        }
    }
}

/// Write access to payload bytes.
pub enum BufMut<'a> {
    /// Plain slice of owned or lent storage.
    Slice(&'a mut [u8]),
    /// Locked window into a block buffer arena.
    Arena(MappedMutexGuard<'a, [u8]>),
}

impl Deref for BufMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BufMut::Slice(s) => s,
            BufMut::Arena(g) => g,
        }
    }
}

impl DerefMut for BufMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            BufMut::Slice(s) => s,
            BufMut::Arena(g) => g,
        }
    }
}

/// Buffer descriptor exchanged between producers and consumers.
///
/// Invariant: `valid_size() <= capacity()`.
#[derive(Debug, Default)]
pub struct Payload {
    storage: Storage,
    valid_size: usize,
    is_done: bool,
    pts: u64,
}

impl Payload {
    /// Creates a payload with no backing buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a payload owning a zeroed buffer of `len` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when `len` is zero, [`Error::MemoryLack`] when the
    /// allocation fails.
    pub fn with_len(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_arg("payload length must be non-zero"));
        }
        Ok(Self {
            storage: Storage::Owned(try_alloc(len)?),
            ..Self::default()
        })
    }

    /// Wraps an existing vector; every byte counts as valid.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let valid_size = data.len();
        Self {
            storage: Storage::Owned(data),
            valid_size,
            ..Self::default()
        }
    }

    /// Size of the backing buffer.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Empty => 0,
            Storage::Owned(v) => v.len(),
            Storage::Lent(l) => l.buf.len(),
            Storage::Region(r) => r.len,
        }
    }

    /// Number of valid bytes at the start of the buffer.
    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    /// Sets the number of valid bytes.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `size` exceeds the capacity.
    pub fn set_valid_size(&mut self, size: usize) -> Result<()> {
        let limit = self.capacity();
        if size > limit {
            return Err(Error::OutOfRange { size, limit });
        }
        self.valid_size = size;
        Ok(())
    }

    /// Whether this payload carries the final bytes of the stream.
    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Marks or clears the end-of-stream flag.
    pub fn set_done(&mut self, done: bool) {
        self.is_done = done;
    }

    /// Clears the end-of-stream flag.
    pub fn clean_done(&mut self) {
        self.is_done = false;
    }

    /// Presentation timestamp.
    pub fn pts(&self) -> u64 {
        self.pts
    }

    /// Sets the presentation timestamp.
    pub fn set_pts(&mut self, pts: u64) {
        self.pts = pts;
    }

    /// Whether dropping this payload frees its buffer.
    pub fn owns_buffer(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Whether the payload currently has any backing buffer.
    pub fn has_buffer(&self) -> bool {
        !matches!(self.storage, Storage::Empty)
    }

    /// The whole backing buffer.
    pub fn buf(&self) -> BufRef<'_> {
        self.view(0..self.capacity())
    }

    /// Mutable access to the whole backing buffer.
    pub fn buf_mut(&mut self) -> BufMut<'_> {
        match &mut self.storage {
            Storage::Empty => BufMut::Slice(&mut []),
            Storage::Owned(v) => BufMut::Slice(v.as_mut_slice()),
            Storage::Lent(l) => BufMut::Slice(l.buf.as_mut_slice()),
            Storage::Region(r) => {
                let range = r.offset..r.offset + r.len;
                BufMut::Arena(MutexGuard::map(r.arena.lock(), move |a| &mut a[range]))
            }
        }
    }

    /// The valid bytes.
    pub fn data(&self) -> BufRef<'_> {
        self.view(0..self.valid_size)
    }

    /// A sub-range of the backing buffer.
    ///
    /// `range` is clamped to the capacity.
    pub fn view(&self, range: Range<usize>) -> BufRef<'_> {
        let cap = self.capacity();
        let end = range.end.min(cap);
        let start = range.start.min(end);
        match &self.storage {
            Storage::Empty => BufRef::Slice(&[]),
            Storage::Owned(v) => BufRef::Slice(&v[start..end]),
            Storage::Lent(l) => BufRef::Slice(&l.buf[start..end]),
            Storage::Region(r) => {
                let abs = r.offset + start..r.offset + end;
                BufRef::Arena(MutexGuard::map(r.arena.lock(), move |a| &mut a[abs]))
            }
        }
    }

    /// Copies `src` into the buffer and marks those bytes valid.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `src` is larger than the capacity.
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        let limit = self.capacity();
        if src.len() > limit {
            return Err(Error::OutOfRange {
                size: src.len(),
                limit,
            });
        }
        self.buf_mut()[..src.len()].copy_from_slice(src);
        self.valid_size = src.len();
        Ok(())
    }

    /// Copies the valid bytes, done flag and timestamp of `src`.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfRange`] if `src.valid_size()` exceeds this payload's capacity.
    pub fn copy_data(&mut self, src: &Payload) -> Result<()> {
        let n = src.valid_size;
        let limit = self.capacity();
        if n > limit {
            tracing::error!("payload copy: {n} bytes into {limit}-byte buffer");
            return Err(Error::OutOfRange { size: n, limit });
        }
        // Two windows of the same arena share one lock.
        let shared = match (self.region(), src.region()) {
            (Some(dst), Some(s)) if Arc::ptr_eq(&dst.arena, &s.arena) => {
                Some((Arc::clone(&dst.arena), s.offset, dst.offset))
            }
            _ => None,
        };
        if let Some((arena, from, to)) = shared {
            arena.lock().copy_within(from..from + n, to);
        } else {
            let data = src.data();
            self.buf_mut()[..n].copy_from_slice(&data);
        }
        self.valid_size = n;
        self.is_done = src.is_done;
        self.pts = src.pts;
        Ok(())
    }

    /// Replaces the buffer with a fresh owned one of at least `len` bytes.
    ///
    /// The new capacity is `len` rounded up to a multiple of `align`. Old
    /// contents are not preserved.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArg`] if `len` is zero.
    /// - [`Error::NotSupport`] if the current buffer is lent by a bus.
    /// - [`Error::MemoryLack`] if allocation fails.
    pub fn realloc_aligned(&mut self, align: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::invalid_arg("realloc length must be non-zero"));
        }
        if matches!(self.storage, Storage::Lent(_) | Storage::Region(_)) {
            return Err(Error::not_support("cannot reallocate a buffer lent by a bus"));
        }
        let align = align.max(1);
        let rounded = len.div_ceil(align) * align;
        self.storage = Storage::Owned(try_alloc(rounded)?);
        self.valid_size = 0;
        Ok(())
    }

    /// Clears the valid size and done flag, keeping the buffer.
    pub fn reset(&mut self) {
        self.valid_size = 0;
        self.is_done = false;
    }

    // --- bus-side storage plumbing ---

    pub(crate) fn lend(&mut self, loan: Loan, valid_size: usize, is_done: bool) {
        self.storage = Storage::Lent(loan);
        self.valid_size = valid_size;
        self.is_done = is_done;
    }

    pub(crate) fn loan(&self) -> Option<(u64, u64)> {
        match &self.storage {
            Storage::Lent(l) => Some((l.bus, l.node)),
            _ => None,
        }
    }

    pub(crate) fn take_loan(&mut self) -> Option<Loan> {
        match std::mem::take(&mut self.storage) {
            Storage::Lent(l) => Some(l),
            other => {
                self.storage = other;
                None
            }
        }
    }

    pub(crate) fn set_region(&mut self, region: Region, valid_size: usize) {
        self.storage = Storage::Region(region);
        self.valid_size = valid_size;
    }

    pub(crate) fn region(&self) -> Option<&Region> {
        match &self.storage {
            Storage::Region(r) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn clear_storage(&mut self) {
        self.storage = Storage::Empty;
        self.valid_size = 0;
    }
}
