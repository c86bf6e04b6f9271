//! Blocking FIFO of reusable node buffers.
//!
//! Like [`PBuf`](super::PBuf) the FIFO lends whole node buffers, but both
//! sides block: a reader waits for a filled node and a writer waits for an
//! idle one once `capacity` nodes exist. Node buffers are reallocated when a
//! request outgrows them.

use parking_lot::{Condvar, Mutex};

use super::node::NodeLists;
use super::{BusKind, DataBus, next_bus_id};
use crate::error::{Error, IoError, IoResult, Result};
use crate::payload::Payload;
use crate::wait::Wait;

/// Node buffers are sized in multiples of this many bytes.
const FIFO_ALIGNMENT: usize = 16;

#[derive(Debug, Default)]
struct FifoState {
    nodes: NodeLists,
    write_done: bool,
    aborted: bool,
}

/// Bounded blocking queue of lent buffers.
#[derive(Debug)]
pub struct Fifo {
    id: u64,
    capacity: usize,
    item_size: usize,
    state: Mutex<FifoState>,
    can_read: Condvar,
    can_write: Condvar,
}

impl Fifo {
    /// Creates a FIFO of at most `capacity` nodes of initially `item_size` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when `capacity` is zero.
    pub fn new(capacity: usize, item_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_arg("fifo capacity must be at least 1"));
        }
        Ok(Self {
            id: next_bus_id(),
            capacity,
            item_size,
            state: Mutex::new(FifoState::default()),
            can_read: Condvar::new(),
            can_write: Condvar::new(),
        })
    }

    fn node_len(&self, wanted: usize) -> usize {
        wanted.max(self.item_size).div_ceil(FIFO_ALIGNMENT) * FIFO_ALIGNMENT
    }
}

impl DataBus for Fifo {
    fn name(&self) -> &str {
        "fifo"
    }

    fn kind(&self) -> BusKind {
        BusKind::Block
    }

    fn acquire_read(&self, load: &mut Payload, _wanted: usize, wait: Wait) -> IoResult<()> {
        let deadline = wait.deadline();
        let mut st = self.state.lock();
        loop {
            if st.aborted {
                return Err(IoError::Abort);
            }
            if let Some(node) = st.nodes.fill.pop_front() {
                st.nodes.lend(self.id, node, load, true);
                return Ok(());
            }
            if st.write_done {
                load.clear_storage();
                load.set_done(true);
                return Ok(());
            }
            if !deadline.wait(&self.can_read, &mut st) {
                tracing::debug!("fifo read timed out");
                return Err(IoError::Timeout);
            }
        }
    }

    fn release_read(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        if !load.has_buffer() {
            return Ok(());
        }
        let mut st = self.state.lock();
        let mut node = st.nodes.reclaim(self.id, load, true)?;
        node.valid = 0;
        node.done = false;
        st.nodes.empty.push_back(node);
        drop(st);
        self.can_write.notify_all();
        Ok(())
    }

    fn acquire_write(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        let deadline = wait.deadline();
        let len = self.node_len(wanted);
        let mut st = self.state.lock();
        let mut node = loop {
            if st.aborted {
                return Err(IoError::Abort);
            }
            if let Some(node) = st.nodes.empty.pop_front() {
                break node;
            }
            if st.nodes.count < self.capacity {
                let node = st.nodes.new_node(len)?;
                tracing::debug!(nodes = st.nodes.count, len, "fifo node created");
                break node;
            }
            if !deadline.wait(&self.can_write, &mut st) {
                tracing::error!(capacity = self.capacity, "fifo write found no free node");
                return Err(IoError::Fail);
            }
        };
        if let Err(e) = node.ensure_len(len) {
            st.nodes.empty.push_front(node);
            return Err(e);
        }
        st.nodes.lend(self.id, node, load, false);
        Ok(())
    }

    fn release_write(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        let mut st = self.state.lock();
        let node = st.nodes.reclaim(self.id, load, false)?;
        st.nodes.fill.push_back(node);
        drop(st);
        self.can_read.notify_all();
        Ok(())
    }

    fn done_write(&self) {
        self.state.lock().write_done = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset_done_write(&self) {
        self.state.lock().write_done = false;
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
        self.can_read.notify_all();
        self.can_write.notify_all();
    }

    fn reset(&self) {
        let mut st = self.state.lock();
        st.nodes.recycle();
        st.write_done = false;
        st.aborted = false;
    }

    fn total_size(&self) -> usize {
        self.state.lock().nodes.total_bytes()
    }

    fn filled_size(&self) -> usize {
        self.state.lock().nodes.filled_bytes()
    }

    fn available(&self) -> usize {
        self.state.lock().nodes.empty_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nodes_are_aligned_and_reused() {
        let bus = Fifo::new(1, 10).unwrap();
        let mut load = Payload::new();
        bus.acquire_write(&mut load, 4, Wait::Immediate).unwrap();
        assert_eq!(load.capacity(), 16);
        load.fill_from(&[1, 2, 3, 4]).unwrap();
        bus.release_write(&mut load, Wait::Immediate).unwrap();

        bus.acquire_read(&mut load, 16, Wait::Immediate).unwrap();
        assert_eq!(&*load.data(), &[1, 2, 3, 4]);
        bus.release_read(&mut load, Wait::Immediate).unwrap();
        assert_eq!(bus.available(), 16);
    }

    #[test]
    fn full_fifo_write_fails_after_wait() {
        let bus = Fifo::new(1, 8).unwrap();
        let mut a = Payload::new();
        let mut b = Payload::new();
        bus.acquire_write(&mut a, 8, Wait::Immediate).unwrap();
        assert_eq!(bus.acquire_write(&mut b, 8, Wait::ms(5)), Err(IoError::Fail));
    }

    #[test]
    fn empty_read_times_out() {
        let bus = Fifo::new(1, 8).unwrap();
        let mut load = Payload::new();
        assert_eq!(bus.acquire_read(&mut load, 8, Wait::ms(5)), Err(IoError::Timeout));
    }

    #[test]
    fn blocked_writer_resumes_after_read() {
        let bus = Arc::new(Fifo::new(1, 8).unwrap());
        bus.write(&[1; 8], false, Wait::Immediate).unwrap();
        let writer = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.write(&[2; 8], true, Wait::Forever))
        };
        thread::sleep(Duration::from_millis(10));
        let mut out = [0u8; 8];
        assert_eq!(bus.read(&mut out, Wait::Forever).unwrap(), (8, false));
        writer.join().unwrap().unwrap();
        assert_eq!(bus.read(&mut out, Wait::Forever).unwrap(), (8, true));
        assert_eq!(out, [2; 8]);
    }

    #[test]
    fn abort_unblocks_reader() {
        let bus = Arc::new(Fifo::new(1, 8).unwrap());
        let reader = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                let mut load = Payload::new();
                bus.acquire_read(&mut load, 8, Wait::Forever)
            })
        };
        thread::sleep(Duration::from_millis(10));
        bus.abort();
        assert_eq!(reader.join().unwrap(), Err(IoError::Abort));
    }

    #[test]
    fn reset_after_abort_behaves_like_new() {
        let bus = Fifo::new(2, 8).unwrap();
        bus.write(&[1; 8], true, Wait::Immediate).unwrap();
        bus.done_write();
        bus.abort();
        bus.reset();
        assert_eq!(bus.filled_size(), 0);
        bus.write(&[2; 8], false, Wait::Immediate).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(bus.read(&mut out, Wait::Immediate), Ok((8, false)));
        assert_eq!(out, [2; 8]);
        assert_eq!(bus.read(&mut out, Wait::Immediate), Err(IoError::Timeout));
    }
}
