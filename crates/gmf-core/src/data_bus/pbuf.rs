//! Pointer buffer: ownership hand-off of whole buffers, never blocking.
//!
//! A writer borrows an idle node buffer (created on demand up to the node
//! capacity), fills it and releases it onto the fill list. A reader takes
//! the oldest filled node and gives it back to the idle list. Buffers move
//! by ownership; bytes are never copied.

use parking_lot::Mutex;

use super::node::NodeLists;
use super::{BusKind, DataBus, next_bus_id};
use crate::error::{Error, IoError, IoResult, Result};
use crate::payload::Payload;
use crate::wait::Wait;

#[derive(Debug, Default)]
struct PbufState {
    nodes: NodeLists,
    write_done: bool,
}

/// Bounded pool of lent buffers.
#[derive(Debug)]
pub struct PBuf {
    id: u64,
    capacity: usize,
    state: Mutex<PbufState>,
}

impl PBuf {
    /// Creates a pointer buffer that lends at most `capacity` buffers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_arg("pbuf capacity must be at least 1"));
        }
        Ok(Self {
            id: next_bus_id(),
            capacity,
            state: Mutex::new(PbufState::default()),
        })
    }
}

impl DataBus for PBuf {
    fn name(&self) -> &str {
        "pbuf"
    }

    fn kind(&self) -> BusKind {
        BusKind::Block
    }

    fn acquire_read(&self, load: &mut Payload, _wanted: usize, _wait: Wait) -> IoResult<()> {
        let mut st = self.state.lock();
        match st.nodes.fill.pop_front() {
            Some(node) => {
                st.nodes.lend(self.id, node, load, true);
                Ok(())
            }
            None if st.write_done => {
                load.clear_storage();
                load.set_done(true);
                Ok(())
            }
            None => {
                tracing::debug!("pbuf read with no filled buffer");
                Err(IoError::Fail)
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
        Ok(())
    }

    fn acquire_write(&self, load: &mut Payload, wanted: usize, _wait: Wait) -> IoResult<()> {
        let mut st = self.state.lock();
        if st.write_done {
            load.clear_storage();
            load.set_done(true);
            return Ok(());
        }
        let mut node = match st.nodes.empty.pop_front() {
            Some(node) => node,
            None if st.nodes.count < self.capacity => st.nodes.new_node(wanted)?,
            None => {
                tracing::error!(capacity = self.capacity, "pbuf out of buffers");
                return Err(IoError::Fail);
            }
        };
        if let Err(e) = node.ensure_len(wanted) {
            st.nodes.empty.push_front(node);
            return Err(e);
        }
        node.valid = 0;
        node.done = false;
        st.nodes.lend(self.id, node, load, false);
        Ok(())
    }

    fn release_write(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        if !load.has_buffer() {
            return Ok(());
        }
        let mut st = self.state.lock();
        let node = st.nodes.reclaim(self.id, load, false)?;
        if node.done {
            st.write_done = true;
        }
        st.nodes.fill.push_back(node);
        Ok(())
    }

    fn done_write(&self) {
        self.state.lock().write_done = true;
    }

    fn reset_done_write(&self) {
        self.state.lock().write_done = false;
    }

    fn abort(&self) {
        // Nothing ever blocks on a pbuf.
    }

    fn reset(&self) {
        let mut st = self.state.lock();
        st.nodes.recycle();
        st.write_done = false;
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

    #[test]
    fn hands_off_buffers_in_order() {
        let bus = PBuf::new(2).unwrap();
        let mut a = Payload::new();
        let mut b = Payload::new();
        bus.acquire_write(&mut a, 4, Wait::Immediate).unwrap();
        bus.acquire_write(&mut b, 4, Wait::Immediate).unwrap();
        a.fill_from(b"aaaa").unwrap();
        b.fill_from(b"bb").unwrap();
        bus.release_write(&mut a, Wait::Immediate).unwrap();
        bus.release_write(&mut b, Wait::Immediate).unwrap();
        assert_eq!(bus.filled_size(), 6);

        let mut r = Payload::new();
        bus.acquire_read(&mut r, 0, Wait::Immediate).unwrap();
        assert_eq!(&*r.data(), b"aaaa");
        bus.release_read(&mut r, Wait::Immediate).unwrap();
        bus.acquire_read(&mut r, 0, Wait::Immediate).unwrap();
        assert_eq!(&*r.data(), b"bb");
    }

    #[test]
    fn capacity_exceeded_fails_without_blocking() {
        let bus = PBuf::new(1).unwrap();
        let mut a = Payload::new();
        let mut b = Payload::new();
        bus.acquire_write(&mut a, 4, Wait::Forever).unwrap();
        assert_eq!(bus.acquire_write(&mut b, 4, Wait::Forever), Err(IoError::Fail));
    }

    #[test]
    fn empty_read_fails() {
        let bus = PBuf::new(1).unwrap();
        let mut r = Payload::new();
        assert_eq!(bus.acquire_read(&mut r, 4, Wait::Forever), Err(IoError::Fail));
    }

    #[test]
    fn release_to_wrong_bus_fails() {
        let one = PBuf::new(1).unwrap();
        let two = PBuf::new(1).unwrap();
        let mut load = Payload::new();
        one.acquire_write(&mut load, 4, Wait::Immediate).unwrap();
        assert_eq!(two.release_write(&mut load, Wait::Immediate), Err(IoError::Fail));
        assert!(one.release_write(&mut load, Wait::Immediate).is_ok());
    }

    #[test]
    fn buffers_grow_on_demand() {
        let bus = PBuf::new(1).unwrap();
        let mut load = Payload::new();
        bus.acquire_write(&mut load, 4, Wait::Immediate).unwrap();
        bus.release_write(&mut load, Wait::Immediate).unwrap();
        bus.acquire_read(&mut load, 0, Wait::Immediate).unwrap();
        bus.release_read(&mut load, Wait::Immediate).unwrap();
        bus.acquire_write(&mut load, 32, Wait::Immediate).unwrap();
        assert_eq!(load.capacity(), 32);
        assert_eq!(bus.total_size(), 32);
    }

    #[test]
    fn reset_returns_filled_buffers() {
        let bus = PBuf::new(2).unwrap();
        bus.write(&[1; 8], true, Wait::Immediate).unwrap();
        bus.reset();
        assert_eq!(bus.filled_size(), 0);
        assert_eq!(bus.available(), 8);
    }

    #[test]
    fn reset_after_abort_behaves_like_new() {
        let bus = PBuf::new(2).unwrap();
        bus.write(&[1; 8], true, Wait::Immediate).unwrap();
        bus.abort();
        bus.reset();
        assert_eq!(bus.filled_size(), 0);
        bus.write(&[2; 8], false, Wait::Immediate).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(bus.read(&mut out, Wait::Immediate), Ok((8, false)));
        assert_eq!(out, [2; 8]);
        assert_eq!(bus.read(&mut out, Wait::Immediate), Err(IoError::Fail));
    }
}
