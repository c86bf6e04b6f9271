//! Data buses: buffered channels with an acquire/release contract.
//!
//! Every bus implements [`DataBus`]. A producer calls
//! [`acquire_write`](DataBus::acquire_write), fills the payload and hands it
//! back with [`release_write`](DataBus::release_write); a consumer does the
//! same with the read pair. Four implementations are provided:
//!
//! | bus | kind | storage | blocking |
//! |---|---|---|---|
//! | [`RingBuf`] | [`BusKind::Byte`] | circular byte ring, copies in and out | yes |
//! | [`BlockBuf`] | [`BusKind::Block`] | circular arena, zero-copy windows | yes |
//! | [`PBuf`] | [`BusKind::Block`] | list of node buffers lent by pointer | never |
//! | [`Fifo`] | [`BusKind::Block`] | bounded list of reusable nodes | yes |
//!
//! A byte bus needs the caller to bring its own buffer; a block bus lends
//! one. [`Port`](crate::Port) uses the kind to decide which side allocates.
//!
//! All blocking calls take a [`Wait`]. [`abort`](DataBus::abort) wakes every
//! parked caller with [`IoError::Abort`]; the bus stays aborted until
//! [`reset`](DataBus::reset).

mod block;
mod fifo;
mod node;
mod pbuf;
mod ringbuf;

pub use block::BlockBuf;
pub use fifo::Fifo;
pub use pbuf::PBuf;
pub use ringbuf::RingBuf;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{IoError, IoResult, Result};
use crate::payload::Payload;
use crate::wait::Wait;

/// Who provides the payload buffer on acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// Copy-based: the caller brings a buffer and the bus copies bytes.
    Byte,
    /// Lending: the bus hands out a buffer it owns.
    Block,
}

impl BusKind {
    /// Bit used in element port-kind masks.
    pub const fn mask(self) -> u8 {
        match self {
            BusKind::Byte => 0b01,
            BusKind::Block => 0b10,
        }
    }
}

/// Common acquire/release contract of every bus.
///
/// One producer and one consumer may use a bus concurrently; each side must
/// release what it acquired before acquiring again.
pub trait DataBus: Send + Sync + fmt::Debug {
    /// Short name of the implementation (`"ringbuf"`, `"block"`, ...).
    fn name(&self) -> &str;

    /// Whether the bus lends buffers or copies bytes.
    fn kind(&self) -> BusKind;

    /// Acquires up to `wanted` bytes for reading.
    ///
    /// On success `load.valid_size()` holds the delivered byte count and
    /// `load.is_done()` marks the final chunk of the stream.
    fn acquire_read(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()>;

    /// Returns a payload obtained from [`acquire_read`](Self::acquire_read).
    fn release_read(&self, load: &mut Payload, wait: Wait) -> IoResult<()>;

    /// Acquires room for `wanted` bytes of writing.
    fn acquire_write(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()>;

    /// Commits `load.valid_size()` bytes. A payload marked done also marks
    /// the stream done.
    fn release_write(&self, load: &mut Payload, wait: Wait) -> IoResult<()>;

    /// Signals that no more data will be written.
    fn done_write(&self);

    /// Clears the done signal.
    fn reset_done_write(&self);

    /// Wakes every blocked caller with [`IoError::Abort`].
    fn abort(&self);

    /// Returns the bus to its freshly created state.
    fn reset(&self);

    /// Total capacity in bytes.
    fn total_size(&self) -> usize;

    /// Bytes waiting to be read.
    fn filled_size(&self) -> usize;

    /// Bytes that can be written without blocking.
    fn available(&self) -> usize;

    /// Reads into `dst`, returning the byte count and the end-of-stream flag.
    ///
    /// For lending buses a node larger than `dst` is truncated.
    fn read(&self, dst: &mut [u8], wait: Wait) -> IoResult<(usize, bool)> {
        if dst.is_empty() {
            return Err(IoError::Fail);
        }
        let mut load = match self.kind() {
            BusKind::Byte => Payload::with_len(dst.len()).map_err(|_| IoError::Fail)?,
            BusKind::Block => Payload::new(),
        };
        self.acquire_read(&mut load, dst.len(), wait)?;
        let n = load.valid_size().min(dst.len());
        dst[..n].copy_from_slice(&load.data()[..n]);
        let last = load.is_done();
        self.release_read(&mut load, wait)?;
        Ok((n, last))
    }

    /// Writes all of `src`, optionally marking it as the end of the stream.
    fn write(&self, src: &[u8], is_last: bool, wait: Wait) -> IoResult<()> {
        if src.is_empty() {
            if is_last {
                self.done_write();
            }
            return Ok(());
        }
        let mut load = match self.kind() {
            BusKind::Byte => Payload::with_len(src.len()).map_err(|_| IoError::Fail)?,
            BusKind::Block => Payload::new(),
        };
        self.acquire_write(&mut load, src.len(), wait)?;
        if load.capacity() < src.len() {
            // Stream already closed; hand the empty window back.
            let _ = load.set_valid_size(0);
            self.release_write(&mut load, wait)?;
            return Err(IoError::Fail);
        }
        load.fill_from(src).map_err(|_| IoError::Fail)?;
        load.set_done(is_last);
        self.release_write(&mut load, wait)
    }
}

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity used to match lent buffers to their bus.
pub(crate) fn next_bus_id() -> u64 {
    NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed)
}

/// Creates a copy-based ring of `num * item_cnt` bytes.
///
/// # Errors
///
/// [`Error::InvalidArg`](crate::Error::InvalidArg) on a zero dimension.
pub fn new_ringbuf(num: usize, item_cnt: usize) -> Result<Arc<dyn DataBus>> {
    Ok(Arc::new(RingBuf::new(num, item_cnt)?))
}

/// Creates a zero-copy block buffer of `num * item_cnt` bytes.
///
/// # Errors
///
/// [`Error::InvalidArg`](crate::Error::InvalidArg) on a zero dimension.
pub fn new_block(num: usize, item_cnt: usize) -> Result<Arc<dyn DataBus>> {
    Ok(Arc::new(BlockBuf::new(num, item_cnt)?))
}

/// Creates a pointer buffer holding at most `num` node buffers.
///
/// # Errors
///
/// [`Error::InvalidArg`](crate::Error::InvalidArg) when `num` is zero.
pub fn new_pbuf(num: usize) -> Result<Arc<dyn DataBus>> {
    Ok(Arc::new(PBuf::new(num)?))
}

/// Creates a FIFO of at most `num` nodes, each initially `item_cnt` bytes.
///
/// # Errors
///
/// [`Error::InvalidArg`](crate::Error::InvalidArg) when `num` is zero.
pub fn new_fifo(num: usize, item_cnt: usize) -> Result<Arc<dyn DataBus>> {
    Ok(Arc::new(Fifo::new(num, item_cnt)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_report_names_and_kinds() {
        let buses = [
            (new_ringbuf(2, 64).unwrap(), "ringbuf", BusKind::Byte),
            (new_block(2, 64).unwrap(), "block", BusKind::Block),
            (new_pbuf(2).unwrap(), "pbuf", BusKind::Block),
            (new_fifo(2, 64).unwrap(), "fifo", BusKind::Block),
        ];
        for (bus, name, kind) in &buses {
            assert_eq!(bus.name(), *name);
            assert_eq!(bus.kind(), *kind);
        }
    }

    #[test]
    fn write_then_read_through_every_bus() {
        for bus in [
            new_ringbuf(1, 64).unwrap(),
            new_block(1, 64).unwrap(),
            new_pbuf(2).unwrap(),
            new_fifo(2, 16).unwrap(),
        ] {
            bus.write(b"gmf!", true, Wait::Immediate).unwrap();
            let mut out = [0u8; 4];
            let (n, last) = bus.read(&mut out, Wait::Immediate).unwrap();
            assert_eq!(n, 4, "{}", bus.name());
            assert_eq!(&out, b"gmf!");
            assert!(last, "{} should flag the final chunk", bus.name());
        }
    }

    #[test]
    fn bus_ids_are_unique() {
        assert_ne!(next_bus_id(), next_bus_id());
    }
}
