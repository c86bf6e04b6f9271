//! Copy-based ring buffer.
//!
//! Readers bring their own payload buffer and the ring copies bytes into it;
//! writers hand over a filled payload on release and the ring copies it in,
//! waiting for room as needed.

use parking_lot::{Condvar, Mutex};

use super::{BusKind, DataBus};
use crate::error::{Error, IoError, IoResult, Result, try_alloc};
use crate::payload::Payload;
use crate::wait::Wait;

#[derive(Debug)]
struct Ring {
    buf: Vec<u8>,
    rd: usize,
    wr: usize,
    fill: usize,
    done: bool,
    aborted: bool,
}

impl Ring {
    fn pop_into(&mut self, dst: &mut [u8]) -> usize {
        let size = self.buf.len();
        let n = dst.len().min(self.fill);
        let first = n.min(size - self.rd);
        dst[..first].copy_from_slice(&self.buf[self.rd..self.rd + first]);
        dst[first..n].copy_from_slice(&self.buf[..n - first]);
        self.rd = (self.rd + n) % size;
        self.fill -= n;
        n
    }

    fn push_from(&mut self, src: &[u8]) -> usize {
        let size = self.buf.len();
        let n = src.len().min(size - self.fill);
        let first = n.min(size - self.wr);
        self.buf[self.wr..self.wr + first].copy_from_slice(&src[..first]);
        self.buf[..n - first].copy_from_slice(&src[first..n]);
        self.wr = (self.wr + n) % size;
        self.fill += n;
        n
    }
}

/// Byte ring of fixed capacity.
#[derive(Debug)]
pub struct RingBuf {
    size: usize,
    ring: Mutex<Ring>,
    can_read: Condvar,
    can_write: Condvar,
}

impl RingBuf {
    /// Creates a ring of `num * item_cnt` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] on a zero dimension, [`Error::MemoryLack`] on
    /// allocation failure.
    pub fn new(num: usize, item_cnt: usize) -> Result<Self> {
        let size = num
            .checked_mul(item_cnt)
            .filter(|&s| s > 0)
            .ok_or_else(|| Error::invalid_arg(format!("ring size {num}x{item_cnt}")))?;
        Ok(Self {
            size,
            ring: Mutex::new(Ring {
                buf: try_alloc(size)?,
                rd: 0,
                wr: 0,
                fill: 0,
                done: false,
                aborted: false,
            }),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        })
    }
}

impl DataBus for RingBuf {
    fn name(&self) -> &str {
        "ringbuf"
    }

    fn kind(&self) -> BusKind {
        BusKind::Byte
    }

    fn acquire_read(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        if wanted == 0 || load.capacity() < wanted {
            tracing::error!(wanted, capacity = load.capacity(), "ring read into a short buffer");
            return Err(IoError::Fail);
        }
        let deadline = wait.deadline();
        let mut ring = self.ring.lock();
        let mut got = 0;
        let mut timed_out = false;
        {
            let mut dst = load.buf_mut();
            loop {
                let n = ring.pop_into(&mut dst[got..wanted]);
                if n > 0 {
                    got += n;
                    self.can_write.notify_all();
                }
                if got == wanted || ring.done || ring.aborted {
                    break;
                }
                if !deadline.wait(&self.can_read, &mut ring) {
                    timed_out = true;
                    break;
                }
            }
        }
        load.set_valid_size(got).map_err(|_| IoError::Fail)?;
        if ring.aborted && got < wanted {
            return Err(IoError::Abort);
        }
        if timed_out {
            return Err(IoError::Timeout);
        }
        load.set_done(ring.done && ring.fill == 0);
        Ok(())
    }

    fn release_read(&self, _load: &mut Payload, _wait: Wait) -> IoResult<()> {
        Ok(())
    }

    fn acquire_write(&self, load: &mut Payload, wanted: usize, _wait: Wait) -> IoResult<()> {
        if self.ring.lock().aborted {
            return Err(IoError::Abort);
        }
        if wanted == 0 || load.capacity() < wanted {
            tracing::error!(wanted, capacity = load.capacity(), "ring write from a short buffer");
            return Err(IoError::Fail);
        }
        load.set_done(false);
        Ok(())
    }

    fn release_write(&self, load: &mut Payload, wait: Wait) -> IoResult<()> {
        let deadline = wait.deadline();
        let data = load.data();
        let mut ring = self.ring.lock();
        let mut put = 0;
        let mut status = Ok(());
        while put < data.len() {
            if ring.aborted {
                status = Err(IoError::Abort);
                break;
            }
            let n = ring.push_from(&data[put..]);
            if n > 0 {
                put += n;
                self.can_read.notify_all();
                continue;
            }
            if !deadline.wait(&self.can_write, &mut ring) {
                tracing::debug!(put, total = data.len(), "ring write timed out");
                status = Err(IoError::Timeout);
                break;
            }
        }
        // The end of stream is recorded even when the tail did not fit.
        if load.is_done() {
            ring.done = true;
            self.can_read.notify_all();
        }
        if put > 0 { Ok(()) } else { status }
    }

    fn done_write(&self) {
        self.ring.lock().done = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset_done_write(&self) {
        self.ring.lock().done = false;
    }

    fn abort(&self) {
        self.ring.lock().aborted = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.rd = 0;
        ring.wr = 0;
        ring.fill = 0;
        ring.done = false;
        ring.aborted = false;
    }

    fn total_size(&self) -> usize {
        self.size
    }

    fn filled_size(&self) -> usize {
        self.ring.lock().fill
    }

    fn available(&self) -> usize {
        self.size - self.ring.lock().fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn read_waits_for_full_request() {
        let bus = Arc::new(RingBuf::new(1, 16).unwrap());
        let writer = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for chunk in [[1u8, 2], [3, 4]] {
                    bus.write(&chunk, false, Wait::Forever).unwrap();
                    thread::sleep(std::time::Duration::from_millis(5));
                }
            })
        };
        let mut load = Payload::with_len(4).unwrap();
        bus.acquire_read(&mut load, 4, Wait::Forever).unwrap();
        assert_eq!(&*load.data(), &[1, 2, 3, 4]);
        writer.join().unwrap();
    }

    #[test]
    fn timeout_keeps_partial_count() {
        let bus = RingBuf::new(1, 16).unwrap();
        bus.write(&[9; 3], false, Wait::Immediate).unwrap();
        let mut load = Payload::with_len(8).unwrap();
        assert_eq!(bus.acquire_read(&mut load, 8, Wait::ms(5)), Err(IoError::Timeout));
        assert_eq!(load.valid_size(), 3);
    }

    #[test]
    fn short_read_after_done_is_last() {
        let bus = RingBuf::new(1, 16).unwrap();
        bus.write(&[1; 5], true, Wait::Immediate).unwrap();
        let mut load = Payload::with_len(8).unwrap();
        bus.acquire_read(&mut load, 8, Wait::Immediate).unwrap();
        assert_eq!(load.valid_size(), 5);
        assert!(load.is_done());
        bus.acquire_read(&mut load, 8, Wait::Immediate).unwrap();
        assert_eq!(load.valid_size(), 0);
        assert!(load.is_done());
    }

    #[test]
    fn wraps_around_the_end() {
        let bus = RingBuf::new(1, 8).unwrap();
        let mut out = [0u8; 6];
        bus.write(&[1; 6], false, Wait::Immediate).unwrap();
        bus.read(&mut out, Wait::Immediate).unwrap();
        bus.write(&[1, 2, 3, 4, 5, 6], false, Wait::Immediate).unwrap();
        bus.read(&mut out, Wait::Immediate).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        assert_eq!(bus.filled_size(), 0);
    }

    #[test]
    fn write_into_full_ring_times_out() {
        let bus = RingBuf::new(1, 4).unwrap();
        bus.write(&[0; 4], false, Wait::Immediate).unwrap();
        assert_eq!(bus.available(), 0);
        assert_eq!(bus.write(&[0; 1], false, Wait::Immediate), Err(IoError::Timeout));
    }

    #[test]
    fn short_final_write_still_ends_the_stream() {
        let bus = RingBuf::new(1, 4).unwrap();
        assert!(bus.write(&[1, 2, 3, 4, 5, 6, 7, 8], true, Wait::ms(10)).is_ok());
        let mut load = Payload::with_len(4).unwrap();
        bus.acquire_read(&mut load, 4, Wait::Forever).unwrap();
        assert_eq!(&*load.data(), &[1, 2, 3, 4]);
        assert!(load.is_done());
        assert_eq!(bus.read(&mut [0; 4], Wait::ms(10)), Ok((0, true)));
    }

    #[test]
    fn aborted_final_write_still_ends_the_stream() {
        let bus = Arc::new(RingBuf::new(1, 4).unwrap());
        let writer = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.write(&[7; 8], true, Wait::Forever))
        };
        while bus.available() > 0 {
            thread::yield_now();
        }
        thread::sleep(std::time::Duration::from_millis(5));
        bus.abort();
        assert!(writer.join().unwrap().is_ok());
        assert!(bus.ring.lock().done);
    }

    #[test]
    fn abort_rejects_writes() {
        let bus = RingBuf::new(1, 4).unwrap();
        bus.abort();
        assert_eq!(bus.write(&[1], false, Wait::Immediate), Err(IoError::Abort));
        bus.reset();
        assert!(bus.write(&[1], false, Wait::Immediate).is_ok());
    }

    #[test]
    fn reset_after_abort_behaves_like_new() {
        let bus = RingBuf::new(1, 8).unwrap();
        bus.write(&[1; 5], true, Wait::Immediate).unwrap();
        bus.abort();
        bus.reset();
        assert_eq!(bus.filled_size(), 0);
        assert_eq!(bus.available(), 8);
        bus.write(&[2; 4], false, Wait::Immediate).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(bus.read(&mut out, Wait::Immediate), Ok((4, false)));
        assert_eq!(out, [2; 4]);
        assert_eq!(bus.read(&mut out, Wait::Immediate), Err(IoError::Timeout));
    }
}
