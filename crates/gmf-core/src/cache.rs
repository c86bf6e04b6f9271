//! Payload cache: fixed-size re-chunking of variable-size input.
//!
//! Some processors consume an exact number of bytes per call (an AEC frame,
//! a wake-word window). Upstream payloads rarely line up with that quantum.
//! [`PayloadCache`] sits between the two: load an input payload, then
//! acquire fixed chunks until the input runs dry.
//!
//! A chunk is served straight from the input payload when enough contiguous
//! input remains and nothing is cached; otherwise the remaining input bytes
//! are copied into the cache buffer once and served from there.
//!
//! ```text
//! input: |--- 700 ---|--- 700 ---|
//! chunk: |-- 512 --|cache|-- 512 --| ...
//! ```
//!
//! The cache only remembers *where* it is in the loaded payload; the payload
//! itself stays with its owner and is passed to every [`acquire`](PayloadCache::acquire).

use std::ops::Deref;

use crate::error::{Error, Result, try_alloc};
use crate::payload::{BufRef, Payload};

#[derive(Debug, Default, Clone, Copy)]
struct OriginView {
    offset: usize,
    remaining: usize,
    done: bool,
    pts: u64,
}

/// Re-chunking adapter. See the [module docs](self).
#[derive(Debug)]
pub struct PayloadCache {
    buf: Vec<u8>,
    filled: usize,
    origin: OriginView,
    last_from_cache: bool,
    last_expected: usize,
}

/// One chunk handed out by [`PayloadCache::acquire`].
pub struct CacheChunk<'a> {
    data: BufRef<'a>,
    is_done: bool,
    pts: u64,
}

impl CacheChunk<'_> {
    /// Bytes in this chunk.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this chunk ends the stream.
    pub fn is_done(&self) -> bool {
        self.is_done
    }

    /// Timestamp of the input this chunk came from.
    pub fn pts(&self) -> u64 {
        self.pts
    }
}

impl Deref for CacheChunk<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl PayloadCache {
    /// Creates a cache whose buffer holds `len` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if `len` is zero, [`Error::MemoryLack`] if the
    /// buffer cannot be allocated.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::invalid_arg("cache length must be non-zero"));
        }
        Ok(Self {
            buf: try_alloc(len)?,
            filled: 0,
            origin: OriginView::default(),
            last_from_cache: false,
            last_expected: 0,
        })
    }

    /// True once every byte of the previously loaded payload was consumed.
    pub fn ready_for_load(&self) -> bool {
        self.origin.remaining == 0
    }

    /// Starts consuming `load`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the previous payload still has bytes left.
    pub fn load(&mut self, load: &Payload) -> Result<()> {
        if !self.ready_for_load() {
            tracing::error!(
                filled = self.filled,
                remaining = self.origin.remaining,
                "cache reloaded before the previous payload was drained"
            );
            return Err(Error::invalid_state("previous payload not drained"));
        }
        self.origin = OriginView {
            offset: 0,
            remaining: load.valid_size(),
            done: load.is_done(),
            pts: load.pts(),
        };
        Ok(())
    }

    /// Yields the next chunk of at most `expected` bytes.
    ///
    /// `origin` must be the payload passed to the last [`load`](Self::load).
    /// A chunk shorter than `expected` means the input ran out: if
    /// [`is_done`](CacheChunk::is_done) is set the stream is over, otherwise
    /// more input is needed.
    ///
    /// # Errors
    ///
    /// [`Error::MemoryLack`] if the cache buffer must grow and cannot.
    pub fn acquire<'a>(&'a mut self, origin: &'a Payload, expected: usize) -> Result<CacheChunk<'a>> {
        if expected > self.buf.len() {
            tracing::info!(from = self.buf.len(), to = expected, "cache buffer grown");
            let mut grown = try_alloc(expected)?;
            grown[..self.filled].copy_from_slice(&self.buf[..self.filled]);
            self.buf = grown;
        }
        self.last_expected = expected;
        let o = self.origin;
        if self.filled == 0 && o.remaining >= expected {
            self.origin.offset += expected;
            self.origin.remaining -= expected;
            self.last_from_cache = false;
            return Ok(CacheChunk {
                data: origin.view(o.offset..o.offset + expected),
                is_done: o.remaining == expected && o.done,
                pts: o.pts,
            });
        }
        let n = (expected - self.filled.min(expected)).min(o.remaining);
        if n > 0 {
            let src = origin.view(o.offset..o.offset + n);
            self.buf[self.filled..self.filled + n].copy_from_slice(&src);
            self.origin.offset += n;
            self.origin.remaining -= n;
            self.filled += n;
        }
        tracing::trace!(filled = self.filled, left = self.origin.remaining, "cache refill");
        self.last_from_cache = true;
        Ok(CacheChunk {
            data: BufRef::Slice(&self.buf[..self.filled]),
            is_done: self.origin.remaining == 0 && self.origin.done,
            pts: self.origin.pts,
        })
    }

    /// Finishes with the last acquired chunk.
    ///
    /// A full chunk served from the cache buffer empties it; a partial one
    /// stays cached so the next load can complete it.
    pub fn release(&mut self) {
        if self.last_from_cache && self.filled >= self.last_expected {
            self.filled = 0;
        }
        self.last_from_cache = false;
    }

    /// Bytes still pending: cached plus unread input.
    pub fn cached_size(&self) -> usize {
        self.filled + self.origin.remaining
    }

    /// Drops all cached and pending input.
    pub fn clear(&mut self) {
        self.filled = 0;
        self.origin = OriginView::default();
        self.last_from_cache = false;
    }
}
