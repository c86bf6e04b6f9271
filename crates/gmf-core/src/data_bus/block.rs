//! Zero-copy block buffer.
//!
//! A fixed arena of `block_size * block_count` bytes used as a circular
//! buffer. Acquire calls return windows directly into the arena, so neither
//! side copies. Windows are always contiguous, which is what makes the
//! pointer algebra below non-trivial.
//!
//! # Pointers
//!
//! - `rd`: start of the next readable byte.
//! - `wr`: start of the next writable byte.
//! - `wr_end`: end of valid data before a wrap. `0` means the writer has not
//!   wrapped past the reader; otherwise the readable region is
//!   `rd..wr_end` followed by `0..wr`.
//!
//! All three stay within `0..=total`. `fill` counts every readable byte and
//! is only touched under the state lock.
//!
//! # Wrap policy
//!
//! When the tail `wr..total` is too small for a write request, the writer
//! wraps to the arena base if the head `0..rd` can hold the request, leaving
//! `wr_end` behind as the tail boundary. When the reader reaches `wr_end` it
//! is handed the shorter contiguous tail rather than blocking, and the next
//! read continues from the base. An empty arena whose pointers sit too close
//! to the end rewinds both pointers to the base first.
//!
//! If a writer is parked for space while the reader wants more bytes than
//! are contiguous, the reader takes what is there instead of waiting, so a
//! request larger than the free space can never stall both sides.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{BusKind, DataBus};
use crate::error::{Error, IoError, IoResult, Result, try_alloc};
use crate::payload::{Arena, Payload, Region};
use crate::wait::Wait;

/// One-shot end-of-stream request raised while a write is in flight.
///
/// Consumed exactly once by the next `release_write`.
#[derive(Debug, Clone, Copy)]
struct DoneMarker;

#[derive(Debug, Default)]
struct BlockState {
    rd: usize,
    wr: usize,
    wr_end: usize,
    fill: usize,
    write_done: bool,
    pending_done: Option<DoneMarker>,
    write_in_flight: bool,
    writer_waiting: bool,
    aborted: bool,
}

impl BlockState {
    /// Contiguous readable bytes starting at `rd`.
    fn fill_size(&self) -> usize {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self.wr.cmp(&self.rd) {
            Greater => self.wr - self.rd,
            Less if self.wr_end == self.rd => self.wr,
            Less => self.wr_end - self.rd,
            Equal if self.wr_end == 0 => 0,
            Equal => self.wr_end - self.wr,
        }
    }

    /// Contiguous writable bytes starting at `wr`.
    fn empty_size(&self, total: usize) -> usize {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self.wr.cmp(&self.rd) {
            Greater => total - self.wr,
            Less if self.wr_end == self.rd => total - self.wr,
            Less => self.rd - self.wr,
            Equal if self.wr_end == 0 => total - self.wr,
            Equal => self.rd - self.wr,
        }
    }
}

/// Zero-copy circular arena. See the [module docs](self).
#[derive(Debug)]
pub struct BlockBuf {
    arena: Arena,
    total: usize,
    state: Mutex<BlockState>,
    can_read: Condvar,
    can_write: Condvar,
}

impl BlockBuf {
    /// Allocates an arena of `block_size * block_count` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] on a zero dimension or overflow,
    /// [`Error::MemoryLack`] if the arena cannot be allocated.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        let total = block_size
            .checked_mul(block_count)
            .filter(|&t| t > 0)
            .ok_or_else(|| {
                Error::invalid_arg(format!("block buffer size {block_size}x{block_count}"))
            })?;
        let arena = try_alloc(total)?.into_boxed_slice();
        tracing::debug!(total, "block buffer created");
        Ok(Self {
            arena: Arc::new(Mutex::new(arena)),
            total,
            state: Mutex::new(BlockState::default()),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        })
    }

    fn window(&self, offset: usize, len: usize) -> Region {
        Region {
            arena: Arc::clone(&self.arena),
            offset,
            len,
        }
    }

    /// Checks that `load` holds a window of this arena starting at `at`.
    fn owns_window(&self, load: &Payload, at: usize) -> bool {
        load.region()
            .is_some_and(|r| Arc::ptr_eq(&r.arena, &self.arena) && r.offset == at)
    }
}

impl DataBus for BlockBuf {
    fn name(&self) -> &str {
        "block"
    }

    fn kind(&self) -> BusKind {
        BusKind::Block
    }

    fn acquire_read(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        if wanted == 0 || wanted > self.total {
            tracing::error!(wanted, total = self.total, "block read request out of range");
            return Err(IoError::Fail);
        }
        let deadline = wait.deadline();
        let mut st = self.state.lock();
        let mut want = wanted;
        if st.fill == 0 && st.write_done {
            want = 0;
        } else {
            while st.fill_size() < want {
                if st.wr_end > 0 {
                    if st.wr_end != st.rd {
                        // Short tail before the wrap point.
                        want = st.wr_end - st.rd;
                        break;
                    }
                    st.wr_end = 0;
                    st.rd = 0;
                    if st.fill_size() >= want {
                        break;
                    }
                }
                if st.write_done {
                    want = st.fill_size();
                    break;
                }
                if st.writer_waiting && st.fill_size() > 0 {
                    want = st.fill_size();
                    break;
                }
                if st.aborted {
                    break;
                }
                if !deadline.wait(&self.can_read, &mut st) {
                    tracing::debug!(wanted, fill = st.fill, "block read timed out");
                    return Err(IoError::Timeout);
                }
            }
        }
        if st.aborted {
            return Err(IoError::Abort);
        }
        let len = want.min(self.total - st.rd);
        let last = st.write_done && len == st.fill;
        load.set_region(self.window(st.rd, len), len);
        load.set_done(last);
        Ok(())
    }

    fn release_read(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        let mut st = self.state.lock();
        let v = load.valid_size();
        if !self.owns_window(load, st.rd) || st.rd + v > self.total || v > st.fill {
            tracing::error!(rd = st.rd, valid = v, "block read release does not match");
            return Err(IoError::Fail);
        }
        st.rd += v;
        st.fill -= v;
        if st.rd == self.total || st.rd == st.wr_end {
            st.rd = 0;
            st.wr_end = 0;
        }
        load.clear_storage();
        drop(st);
        self.can_write.notify_all();
        Ok(())
    }

    fn acquire_write(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        if wanted == 0 || wanted > self.total {
            tracing::error!(wanted, total = self.total, "block write request out of range");
            return Err(IoError::Fail);
        }
        let deadline = wait.deadline();
        let mut st = self.state.lock();
        if st.empty_size(self.total) == 0 && st.write_done {
            load.set_region(self.window(st.wr, 0), 0);
            load.set_done(true);
            return Ok(());
        }
        while st.empty_size(self.total) < wanted {
            // Empty arena with a short tail: start over at the base.
            if st.fill == 0 && st.rd == st.wr && st.wr_end == 0 && self.total - st.wr < wanted {
                st.rd = 0;
                st.wr = 0;
                continue;
            }
            if st.wr >= st.rd && self.total - st.wr < wanted && st.rd >= wanted && st.wr_end == 0 {
                st.wr_end = st.wr;
                st.wr = 0;
                break;
            }
            if st.write_done {
                st.writer_waiting = false;
                load.set_region(self.window(st.wr, 0), 0);
                load.set_done(true);
                return Ok(());
            }
            if st.aborted {
                break;
            }
            st.writer_waiting = true;
            self.can_read.notify_all();
            if !deadline.wait(&self.can_write, &mut st) {
                st.writer_waiting = false;
                tracing::debug!(wanted, fill = st.fill, "block write timed out");
                return Err(IoError::Timeout);
            }
        }
        st.writer_waiting = false;
        if st.aborted {
            return Err(IoError::Abort);
        }
        st.write_in_flight = true;
        load.set_region(self.window(st.wr, wanted), 0);
        load.set_done(false);
        Ok(())
    }

    fn release_write(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        let mut st = self.state.lock();
        let v = load.valid_size();
        if !self.owns_window(load, st.wr) || st.wr + v > self.total {
            tracing::error!(wr = st.wr, valid = v, "block write release does not match");
            return Err(IoError::Fail);
        }
        st.wr += v;
        st.fill += v;
        if st.wr == self.total {
            st.wr = 0;
            st.wr_end = self.total;
        }
        st.write_in_flight = false;
        if st.pending_done.take().is_some() || load.is_done() {
            st.write_done = true;
        }
        load.clear_storage();
        drop(st);
        self.can_read.notify_all();
        Ok(())
    }

    fn done_write(&self) {
        let mut st = self.state.lock();
        if st.write_in_flight {
            st.pending_done = Some(DoneMarker);
        } else {
            st.write_done = true;
        }
        drop(st);
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset_done_write(&self) {
        let mut st = self.state.lock();
        st.write_done = false;
        st.pending_done = None;
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset(&self) {
        *self.state.lock() = BlockState::default();
    }

    fn total_size(&self) -> usize {
        self.total
    }

    fn filled_size(&self) -> usize {
        self.state.lock().fill
    }

    fn available(&self) -> usize {
        self.total - self.state.lock().fill
    }
}
