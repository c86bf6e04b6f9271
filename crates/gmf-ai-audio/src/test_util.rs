//! Test wiring for single elements.

use std::sync::Arc;

use gmf_core::{BusKind, DataBus, Element, Endpoint, Port, PortAttr, PortDir, PortLink, Wait, new_ringbuf};

/// An element fed through a link and writing into a ring.
pub(crate) struct Harness {
    pub(crate) el: Element,
    up: Port,
    dst: Arc<dyn DataBus>,
}

impl Harness {
    pub(crate) fn new(mut el: Element) -> Self {
        let link = PortLink::new();
        let up = Port::new(PortDir::Out, BusKind::Byte, Endpoint::Link(Arc::clone(&link)), PortAttr::default());
        el.register_in_port(Port::new(PortDir::In, BusKind::Byte, Endpoint::Link(link), PortAttr::default()))
            .unwrap();
        let dst = new_ringbuf(1, 8192).unwrap();
        el.register_out_port(Port::writer(Arc::clone(&dst), PortAttr::default())).unwrap();
        Self { el, up, dst }
    }

    /// Hands one payload to the element.
    pub(crate) fn feed(&mut self, bytes: &[u8], done: bool) {
        let load = self.up.acquire_out(bytes.len()).unwrap();
        load.fill_from(bytes).unwrap();
        load.set_done(done);
        self.up.release_out().unwrap();
    }

    /// Everything written so far, as samples.
    pub(crate) fn drain(&self) -> Vec<i16> {
        let mut bytes = vec![0u8; self.dst.filled_size()];
        if !bytes.is_empty() {
            self.dst.read(&mut bytes, Wait::Immediate).unwrap();
        }
        bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
    }
}

/// Interleaved ramp of `points * channels` distinct samples.
pub(crate) fn frames(points: usize, channels: usize) -> Vec<i16> {
    (0..points * channels).map(|i| i as i16 * 7 - 100).collect()
}
