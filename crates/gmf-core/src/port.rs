//! Ports: an element's typed connection to a bus, an IO or a neighbour.
//!
//! A [`Port`] has a direction, a [`BusKind`] and one endpoint:
//!
//! - [`Endpoint::Io`]: any [`PortIo`], typically a [`BusReader`] or
//!   [`BusWriter`] over a [`DataBus`], or a user source/sink.
//! - [`Endpoint::Link`]: a [`PortLink`] shared with the adjacent element in
//!   a pipeline. The upstream out port publishes a payload, the downstream in
//!   port takes it and later hands the buffer back for reuse.
//!
//! # Sharing
//!
//! [`Port::acquire_out_from`] lets an element pass its input payload straight
//! to its output when both ports are shared. The payload moves by ownership
//! and remembers where it came from ([`Origin`]). Whoever releases it last
//! (the out port for an IO sink, or the next element's in port) returns it
//! to that origin, exactly once. Sharing is strictly between two neighbours
//! in a chain; nothing else can alias the buffer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data_bus::{BusKind, DataBus};
use crate::error::{IoError, IoResult};
use crate::payload::Payload;
use crate::wait::Wait;

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    /// Data flows into the element.
    In,
    /// Data flows out of the element.
    Out,
}

/// Port attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    /// Buffers allocated by the port are rounded up to this many bytes.
    pub alignment: usize,
    /// Blocking policy for acquire and release.
    pub wait: Wait,
}

impl Default for PortAttr {
    fn default() -> Self {
        Self {
            alignment: 4,
            wait: Wait::Forever,
        }
    }
}

/// Source or sink behind a port.
///
/// An IO is direction specific: a reader implements acquire/release as a
/// read pair, a writer as a write pair.
pub trait PortIo: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Kind of data this IO carries.
    fn kind(&self) -> BusKind {
        BusKind::Byte
    }

    /// Unblocks any caller parked in [`acquire`](Self::acquire).
    fn abort(&self) {}

    /// Called when the owning pipeline starts running.
    fn open(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Called when the owning pipeline finishes, stops or fails.
    fn close(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Acquires up to `wanted` bytes (reader) or room for them (writer).
    fn acquire(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()>;

    /// Releases what [`acquire`](Self::acquire) returned.
    fn release(&self, load: &mut Payload, wait: Wait) -> IoResult<()>;
}

/// Reads from a [`DataBus`].
pub struct BusReader(pub Arc<dyn DataBus>);

impl PortIo for BusReader {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn kind(&self) -> BusKind {
        self.0.kind()
    }

    fn abort(&self) {
        self.0.abort();
    }

    fn acquire(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        self.0.acquire_read(load, wanted, wait)
    }

    fn release(&self, load: &mut Payload, wait: Wait) -> IoResult<()> {
        self.0.release_read(load, wait)
    }
}

/// Writes to a [`DataBus`].
pub struct BusWriter(pub Arc<dyn DataBus>);

impl PortIo for BusWriter {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn kind(&self) -> BusKind {
        self.0.kind()
    }

    fn abort(&self) {
        self.0.abort();
    }

    fn close(&self) -> crate::Result<()> {
        self.0.done_write();
        Ok(())
    }

    fn acquire(&self, load: &mut Payload, wanted: usize, wait: Wait) -> IoResult<()> {
        self.0.acquire_write(load, wanted, wait)
    }

    fn release(&self, load: &mut Payload, wait: Wait) -> IoResult<()> {
        self.0.release_write(load, wait)
    }
}

/// Where a shared payload must be returned.
pub enum Origin {
    /// Release back to an IO, restoring the valid size it was handed out with.
    Io {
        /// The IO that lent the buffer.
        io: Arc<dyn PortIo>,
        /// Valid size at the time it was shared.
        valid: usize,
        /// Wait policy of the original port.
        wait: Wait,
    },
    /// Return the buffer to an upstream link for reuse.
    Link(Arc<PortLink>),
}

impl Origin {
    fn release(self, mut load: Payload) -> IoResult<()> {
        match self {
            Origin::Io { io, valid, wait } => {
                load.set_valid_size(valid).map_err(|_| IoError::Fail)?;
                io.release(&mut load, wait)
            }
            Origin::Link(link) => {
                link.put_spare(load);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
struct LinkSlot {
    ready: Option<(Payload, Option<Origin>)>,
    spare: Option<Payload>,
}

/// Hand-off slot between two adjacent elements.
#[derive(Default)]
pub struct PortLink {
    slot: Mutex<LinkSlot>,
}

impl PortLink {
    /// Creates an empty link.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether a payload is waiting for the downstream element.
    pub fn has_ready(&self) -> bool {
        self.slot.lock().ready.is_some()
    }

    fn take_ready(&self) -> Option<(Payload, Option<Origin>)> {
        self.slot.lock().ready.take()
    }

    fn put_ready(&self, load: Payload, origin: Option<Origin>) -> IoResult<()> {
        let mut slot = self.slot.lock();
        if slot.ready.is_some() {
            tracing::error!("link already holds an unconsumed payload");
            return Err(IoError::Fail);
        }
        slot.ready = Some((load, origin));
        Ok(())
    }

    fn take_spare(&self) -> Option<Payload> {
        self.slot.lock().spare.take()
    }

    fn put_spare(&self, mut load: Payload) {
        load.reset();
        self.slot.lock().spare = Some(load);
    }

    fn clear(&self) -> IoResult<()> {
        let ready = self.slot.lock().ready.take();
        match ready {
            Some((load, Some(origin))) => origin.release(load),
            _ => Ok(()),
        }
    }
}

/// What a port is connected to.
pub enum Endpoint {
    /// Not connected yet.
    Unbound,
    /// A source or sink.
    Io(Arc<dyn PortIo>),
    /// The neighbouring element.
    Link(Arc<PortLink>),
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unbound => f.write_str("Unbound"),
            Endpoint::Io(io) => write!(f, "Io({})", io.name()),
            Endpoint::Link(_) => f.write_str("Link"),
        }
    }
}

/// Directional, typed connection of one element.
pub struct Port {
    dir: PortDir,
    kind: BusKind,
    attr: PortAttr,
    shared: bool,
    endpoint: Endpoint,
    payload: Option<Payload>,
    origin: Option<Origin>,
    spare: Option<Payload>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("dir", &self.dir)
            .field("kind", &self.kind)
            .field("attr", &self.attr)
            .field("shared", &self.shared)
            .field("endpoint", &self.endpoint)
            .field("held", &self.payload.is_some())
            .finish()
    }
}

impl Port {
    /// Creates a port; sharing is enabled by default.
    pub fn new(dir: PortDir, kind: BusKind, endpoint: Endpoint, attr: PortAttr) -> Self {
        Self {
            dir,
            kind,
            attr,
            shared: true,
            endpoint,
            payload: None,
            origin: None,
            spare: None,
        }
    }

    /// Input port reading from `bus`.
    pub fn reader(bus: Arc<dyn DataBus>, attr: PortAttr) -> Self {
        Self::from_io(PortDir::In, Arc::new(BusReader(bus)), attr)
    }

    /// Output port writing to `bus`.
    pub fn writer(bus: Arc<dyn DataBus>, attr: PortAttr) -> Self {
        Self::from_io(PortDir::Out, Arc::new(BusWriter(bus)), attr)
    }

    /// Port over any IO, taking the IO's kind.
    pub fn from_io(dir: PortDir, io: Arc<dyn PortIo>, attr: PortAttr) -> Self {
        let kind = io.kind();
        Self::new(dir, kind, Endpoint::Io(io), attr)
    }

    /// Direction.
    pub fn dir(&self) -> PortDir {
        self.dir
    }

    /// Bus kind.
    pub fn kind(&self) -> BusKind {
        self.kind
    }

    /// Attributes.
    pub fn attr(&self) -> PortAttr {
        self.attr
    }

    /// Whether payloads may be passed through without copying.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Allows or forbids zero-copy sharing through this port.
    pub fn enable_share(&mut self, enable: bool) {
        self.shared = enable;
    }

    /// Changes the blocking policy.
    pub fn set_wait(&mut self, wait: Wait) {
        self.attr.wait = wait;
    }

    /// Changes the buffer alignment used for later allocations.
    pub fn set_alignment(&mut self, alignment: usize) {
        self.attr.alignment = alignment.max(1);
    }

    /// The IO behind this port, if any.
    pub fn io(&self) -> Option<&Arc<dyn PortIo>> {
        match &self.endpoint {
            Endpoint::Io(io) => Some(io),
            _ => None,
        }
    }

    /// Currently held payload.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Currently held payload, mutably.
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    /// Whether a payload is acquired and not yet released.
    pub fn is_held(&self) -> bool {
        self.payload.is_some()
    }

    fn prepared(&mut self, wanted: usize) -> IoResult<Payload> {
        let mut load = self.spare.take().unwrap_or_default();
        if self.kind == BusKind::Byte && (load.capacity() < wanted || !load.owns_buffer()) {
            load.realloc_aligned(self.attr.alignment, wanted.max(1))
                .map_err(|_| IoError::Fail)?;
        }
        load.reset();
        Ok(load)
    }

    /// Acquires input. A payload already held is returned again.
    ///
    /// # Errors
    ///
    /// The endpoint's error; [`IoError::Fail`] when a link has nothing ready.
    pub fn acquire_in(&mut self, wanted: usize) -> IoResult<&mut Payload> {
        if self.payload.is_some() {
            return self.payload.as_mut().ok_or(IoError::Fail);
        }
        match &self.endpoint {
            Endpoint::Io(io) => {
                let io = Arc::clone(io);
                let mut load = self.prepared(wanted)?;
                if let Err(e) = io.acquire(&mut load, wanted, self.attr.wait) {
                    self.spare = Some(load);
                    return Err(e);
                }
                Ok(self.payload.insert(load))
            }
            Endpoint::Link(link) => {
                let (load, origin) = link.take_ready().ok_or(IoError::Fail)?;
                self.origin = origin;
                Ok(self.payload.insert(load))
            }
            Endpoint::Unbound => Err(IoError::Fail),
        }
    }

    /// Releases the held input.
    ///
    /// Shared payloads go back to their origin; link payloads are offered
    /// back to the upstream element for reuse.
    pub fn release_in(&mut self) -> IoResult<()> {
        let Some(mut load) = self.payload.take() else {
            return Ok(());
        };
        if let Some(origin) = self.origin.take() {
            return origin.release(load);
        }
        match &self.endpoint {
            Endpoint::Io(io) => {
                let res = io.release(&mut load, self.attr.wait);
                self.spare = Some(load);
                res
            }
            Endpoint::Link(link) => {
                link.put_spare(load);
                Ok(())
            }
            Endpoint::Unbound => Err(IoError::Fail),
        }
    }

    /// Acquires an output payload with room for `wanted` bytes.
    ///
    /// # Errors
    ///
    /// The endpoint's error; [`IoError::Fail`] if no buffer can be allocated.
    pub fn acquire_out(&mut self, wanted: usize) -> IoResult<&mut Payload> {
        if self.payload.is_some() {
            return self.payload.as_mut().ok_or(IoError::Fail);
        }
        match &self.endpoint {
            Endpoint::Link(link) => {
                let mut load = link
                    .take_spare()
                    .or_else(|| self.spare.take())
                    .unwrap_or_default();
                if load.capacity() < wanted || !load.owns_buffer() {
                    load.realloc_aligned(self.attr.alignment, wanted.max(1))
                        .map_err(|_| IoError::Fail)?;
                }
                load.reset();
                Ok(self.payload.insert(load))
            }
            Endpoint::Io(io) => {
                let io = Arc::clone(io);
                let mut load = self.prepared(wanted)?;
                if let Err(e) = io.acquire(&mut load, wanted, self.attr.wait) {
                    self.spare = Some(load);
                    return Err(e);
                }
                Ok(self.payload.insert(load))
            }
            Endpoint::Unbound => Err(IoError::Fail),
        }
    }

    /// Produces output from the payload held by `input`.
    ///
    /// When both ports are shared and this port can carry a foreign buffer
    /// (a link or a byte IO), the input payload moves here without copying
    /// and the input port is left empty. Otherwise an output payload is
    /// acquired and the input bytes are copied into it.
    ///
    /// # Errors
    ///
    /// [`IoError::Fail`] if `input` holds nothing or `wanted` exceeds the
    /// input buffer.
    pub fn acquire_out_from(&mut self, input: &mut Port, wanted: usize) -> IoResult<&mut Payload> {
        let Some(in_load) = input.payload.as_ref() else {
            return Err(IoError::Fail);
        };
        if wanted > in_load.capacity() {
            tracing::error!(wanted, capacity = in_load.capacity(), "forward larger than input buffer");
            return Err(IoError::Fail);
        }
        let can_carry = match &self.endpoint {
            Endpoint::Link(_) => true,
            Endpoint::Io(_) => self.kind == BusKind::Byte,
            Endpoint::Unbound => false,
        };
        if self.payload.is_none() && self.shared && input.shared && can_carry {
            let load = input.payload.take().ok_or(IoError::Fail)?;
            let origin = match input.origin.take() {
                Some(origin) => Some(origin),
                None => match &input.endpoint {
                    Endpoint::Io(io) => Some(Origin::Io {
                        io: Arc::clone(io),
                        valid: load.valid_size(),
                        wait: input.attr.wait,
                    }),
                    Endpoint::Link(link) => Some(Origin::Link(Arc::clone(link))),
                    Endpoint::Unbound => None,
                },
            };
            self.origin = origin;
            return Ok(self.payload.insert(load));
        }
        let out = self.acquire_out(wanted)?;
        let src = input.payload.as_ref().ok_or(IoError::Fail)?;
        out.copy_data(src).map_err(|_| IoError::Fail)?;
        Ok(out)
    }

    /// Publishes the held output.
    pub fn release_out(&mut self) -> IoResult<()> {
        let Some(mut load) = self.payload.take() else {
            return Ok(());
        };
        match &self.endpoint {
            Endpoint::Link(link) => link.put_ready(load, self.origin.take()),
            Endpoint::Io(io) => {
                let res = io.release(&mut load, self.attr.wait);
                match self.origin.take() {
                    Some(origin) => origin.release(load).and(res),
                    None => {
                        self.spare = Some(load);
                        res
                    }
                }
            }
            Endpoint::Unbound => Err(IoError::Fail),
        }
    }

    /// Drops any held payload, returning shared ones to their origin.
    pub fn reset(&mut self) {
        let held = self.payload.take();
        if let (Some(load), Some(origin)) = (held, self.origin.take()) {
            if let Err(e) = origin.release(load) {
                tracing::warn!("port reset could not return shared payload: {e}");
            }
        }
        if let Endpoint::Link(link) = &self.endpoint {
            if let Err(e) = link.clear() {
                tracing::warn!("link reset could not return shared payload: {e}");
            }
        }
    }
}
