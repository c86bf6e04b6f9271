//! Node buffers shared by the list-based buses ([`PBuf`](super::PBuf) and
//! [`Fifo`](super::Fifo)).

use std::collections::VecDeque;

use crate::error::{IoError, IoResult, try_alloc};
use crate::payload::{Loan, Payload};

#[derive(Debug)]
pub(super) struct Node {
    pub(super) id: u64,
    pub(super) buf: Vec<u8>,
    pub(super) valid: usize,
    pub(super) done: bool,
}

impl Node {
    pub(super) fn with_len(id: u64, len: usize) -> IoResult<Self> {
        Ok(Self {
            id,
            buf: try_alloc(len).map_err(|_| IoError::Fail)?,
            valid: 0,
            done: false,
        })
    }

    /// Grows the buffer to at least `len` bytes; contents are discarded.
    pub(super) fn ensure_len(&mut self, len: usize) -> IoResult<()> {
        if self.buf.len() < len {
            self.buf = try_alloc(len).map_err(|_| IoError::Fail)?;
        }
        Ok(())
    }
}

/// Node bookkeeping: which nodes are idle, which hold data and which are on loan.
#[derive(Debug, Default)]
pub(super) struct NodeLists {
    pub(super) empty: VecDeque<Node>,
    pub(super) fill: VecDeque<Node>,
    pub(super) lent_read: Vec<u64>,
    pub(super) lent_write: Vec<u64>,
    /// Every node ever created and not yet dropped.
    pub(super) count: usize,
    next_id: u64,
    /// Capacity of lent nodes, kept so size queries stay accurate.
    lent_bytes: usize,
}

impl NodeLists {
    pub(super) fn new_node(&mut self, len: usize) -> IoResult<Node> {
        self.next_id += 1;
        let node = Node::with_len(self.next_id, len)?;
        self.count += 1;
        Ok(node)
    }

    /// Hands `node` to the caller through `load`.
    pub(super) fn lend(&mut self, bus: u64, node: Node, load: &mut Payload, for_read: bool) {
        let Node { id, buf, valid, done } = node;
        self.lent_bytes += buf.len();
        if for_read {
            self.lent_read.push(id);
        } else {
            self.lent_write.push(id);
        }
        load.lend(Loan { bus, node: id, buf }, valid, done);
    }

    /// Takes a lent node back out of `load`, verifying it came from this bus.
    pub(super) fn reclaim(&mut self, bus: u64, load: &mut Payload, for_read: bool) -> IoResult<Node> {
        let Some((owner, id)) = load.loan() else {
            tracing::error!("release of a payload that holds no lent buffer");
            return Err(IoError::Fail);
        };
        let lent = if for_read {
            &mut self.lent_read
        } else {
            &mut self.lent_write
        };
        let Some(pos) = lent.iter().position(|&n| n == id).filter(|_| owner == bus) else {
            tracing::error!(owner, node = id, "release of a buffer this bus did not lend");
            return Err(IoError::Fail);
        };
        lent.swap_remove(pos);
        let valid = load.valid_size();
        let done = load.is_done();
        let loan = load.take_loan().ok_or(IoError::Fail)?;
        load.clear_storage();
        self.lent_bytes -= loan.buf.len();
        Ok(Node {
            id,
            valid: valid.min(loan.buf.len()),
            buf: loan.buf,
            done,
        })
    }

    pub(super) fn empty_bytes(&self) -> usize {
        self.empty.iter().map(|n| n.buf.len()).sum()
    }

    pub(super) fn filled_bytes(&self) -> usize {
        self.fill.iter().map(|n| n.valid).sum()
    }

    pub(super) fn total_bytes(&self) -> usize {
        self.empty_bytes() + self.fill.iter().map(|n| n.buf.len()).sum::<usize>() + self.lent_bytes
    }

    /// Moves every filled node back to the idle list and clears node flags.
    ///
    /// Outstanding loans are forgotten; releasing them afterwards fails.
    pub(super) fn recycle(&mut self) {
        self.count -= self.lent_read.len() + self.lent_write.len();
        self.lent_read.clear();
        self.lent_write.clear();
        self.lent_bytes = 0;
        while let Some(node) = self.fill.pop_front() {
            self.empty.push_back(node);
        }
        for node in &mut self.empty {
            node.valid = 0;
            node.done = false;
        }
    }
}
