//! Stock elements.
//!
//! - [`CopyElement`] forwards input unchanged, zero copy when ports allow.
//! - [`GainElement`] scales 16-bit little-endian PCM in place.
//! - [`FramerElement`] re-chunks input into fixed frames through a
//!   [`PayloadCache`], returning `Truncate` while the input still holds
//!   whole frames.

use crate::cache::PayloadCache;
use crate::cap::{ArgType, Capability, Method, MethodArgs};
use crate::element::{Element, ElementConfig, ElementCore, ElementOps};
use crate::error::{IoError, IoResult, Result};
use crate::job::JobStatus;
use crate::payload::Payload;
use crate::port::Port;

/// Acquires input for a process call, mapping the outcome to a job status
/// when nothing usable came back.
fn acquire_input(tag: &str, inp: &mut Port, wanted: usize) -> std::result::Result<(), JobStatus> {
    match inp.acquire_in(wanted) {
        Ok(_) => Ok(()),
        Err(IoError::Abort) => {
            tracing::debug!(el = tag, "input aborted");
            Err(JobStatus::Ok)
        }
        Err(e) => {
            tracing::error!(el = tag, "input acquire failed: {e}");
            Err(JobStatus::Fail)
        }
    }
}

/// Passes the held input payload to `out`.
///
/// An empty payload is not written to an IO; closing the IO marks the end
/// of stream there.
pub fn pass_through(inp: &mut Port, out: &mut Port) -> IoResult<()> {
    let valid = inp.payload().map_or(0, Payload::valid_size);
    if valid == 0 && out.io().is_some() {
        return Ok(());
    }
    out.acquire_out_from(inp, valid)?;
    out.release_out()
}

fn finish(tag: &str, inp: &mut Port, done: bool) -> JobStatus {
    if let Err(e) = inp.release_in() {
        tracing::error!(el = tag, "input release failed: {e}");
        return JobStatus::Fail;
    }
    if done { JobStatus::Done } else { JobStatus::Ok }
}

/// Hands the input back after a failed output write.
fn fail_released(tag: &str, inp: &mut Port) -> JobStatus {
    if let Err(e) = inp.release_in() {
        tracing::warn!(el = tag, "input release after failure: {e}");
    }
    JobStatus::Fail
}

/// Forwards input to output unchanged.
#[derive(Debug, Default)]
pub struct CopyElement;

impl CopyElement {
    /// Copy element with the given per-call data size.
    pub fn element(tag: &str, data_size: usize) -> Element {
        let config = ElementConfig {
            data_size,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(Self))
    }
}

impl ElementOps for CopyElement {
    fn open(&mut self, _core: &mut ElementCore) -> JobStatus {
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let size = core.config().data_size;
        let tag = core.tag().to_owned();
        let (Some(inp), out) = core.ports_mut() else {
            return JobStatus::Fail;
        };
        if let Err(status) = acquire_input(&tag, inp, size) {
            return status;
        }
        let done = inp.payload().is_some_and(Payload::is_done);
        if let Some(out) = out {
            match pass_through(inp, out) {
                Ok(()) => {}
                Err(IoError::Abort) => return finish(&tag, inp, false),
                Err(e) => {
                    tracing::error!(el = %tag, "output failed: {e}");
                    return fail_released(&tag, inp);
                }
            }
        }
        finish(&tag, inp, done)
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        JobStatus::Ok
    }
}

/// Scales 16-bit little-endian PCM by a gain in dB.
#[derive(Debug)]
pub struct GainElement {
    gain_db: f32,
    linear: f32,
}

impl GainElement {
    /// Gain element starting at `gain_db`.
    pub fn element(tag: &str, data_size: usize, gain_db: f32) -> Element {
        let config = ElementConfig {
            data_size,
            alignment: 2,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(Self::new(gain_db)))
    }

    fn new(gain_db: f32) -> Self {
        Self {
            gain_db,
            linear: db_to_linear(gain_db),
        }
    }

    /// Current gain in dB.
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    fn apply(&self, pcm: &mut [u8]) {
        for frame in pcm.chunks_exact_mut(2) {
            let s = f32::from(i16::from_le_bytes([frame[0], frame[1]]));
            let v = (s * self.linear).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX));
            #[allow(clippy::cast_possible_truncation)]
            frame.copy_from_slice(&(v as i16).to_le_bytes());
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    libm::powf(10.0, db / 20.0)
}

impl ElementOps for GainElement {
    fn open(&mut self, _core: &mut ElementCore) -> JobStatus {
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let size = core.config().data_size;
        let tag = core.tag().to_owned();
        let (Some(inp), out) = core.ports_mut() else {
            return JobStatus::Fail;
        };
        if let Err(status) = acquire_input(&tag, inp, size) {
            return status;
        }
        let mut done = false;
        if let Some(load) = inp.payload_mut() {
            done = load.is_done();
            let valid = load.valid_size();
            if (self.linear - 1.0).abs() > f32::EPSILON {
                self.apply(&mut load.buf_mut()[..valid]);
            }
        }
        if let Some(out) = out {
            if let Err(e) = pass_through(inp, out) {
                if e.is_abort() {
                    return finish(&tag, inp, false);
                }
                tracing::error!(el = %tag, "output failed: {e}");
                return fail_released(&tag, inp);
            }
        }
        finish(&tag, inp, done)
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        JobStatus::Ok
    }

    fn caps(&self) -> Vec<Capability> {
        vec![Capability::new("GAIN")]
    }

    fn methods(&self) -> Vec<Method> {
        vec![Method::new("set_gain", &[("db", ArgType::F32)])]
    }

    fn exec_method(&mut self, core: &mut ElementCore, _name: &str, args: &MethodArgs) -> Result<()> {
        let db = args.get_f32("db")?;
        tracing::info!(el = %core.tag(), gain_db = db, "gain changed");
        *self = Self::new(db);
        Ok(())
    }
}

/// Emits fixed-size frames regardless of input payload sizes.
///
/// The final frame of a stream may be short.
#[derive(Debug)]
pub struct FramerElement {
    frame: usize,
    cache: Option<PayloadCache>,
}

impl FramerElement {
    /// Framer producing `frame`-byte outputs, reading `data_size` bytes of
    /// input per acquire.
    pub fn element(tag: &str, data_size: usize, frame: usize) -> Element {
        let config = ElementConfig {
            data_size,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(Self { frame, cache: None }))
    }
}

impl ElementOps for FramerElement {
    fn open(&mut self, core: &mut ElementCore) -> JobStatus {
        match PayloadCache::new(self.frame) {
            Ok(cache) => {
                self.cache = Some(cache);
                JobStatus::Ok
            }
            Err(e) => {
                tracing::error!(el = %core.tag(), frame = self.frame, "cache allocation failed: {e}");
                JobStatus::Fail
            }
        }
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let size = core.config().data_size;
        let tag = core.tag().to_owned();
        let frame = self.frame;
        let Some(cache) = self.cache.as_mut() else {
            return JobStatus::Fail;
        };
        let (Some(inp), out) = core.ports_mut() else {
            return JobStatus::Fail;
        };
        if cache.ready_for_load() {
            if let Err(status) = acquire_input(&tag, inp, size) {
                return status;
            }
            if let Some(load) = inp.payload() {
                if let Err(e) = cache.load(load) {
                    tracing::error!(el = %tag, "cache load failed: {e}");
                    return JobStatus::Fail;
                }
            }
        }
        let Some(load) = inp.payload() else {
            return JobStatus::Fail;
        };
        let (len, done) = {
            let chunk = match cache.acquire(load, frame) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(el = %tag, "cache acquire failed: {e}");
                    return JobStatus::Fail;
                }
            };
            let (len, done) = (chunk.len(), chunk.is_done());
            if len < frame && !done {
                (len, None)
            } else {
                let written = match out {
                    Some(out) if len > 0 || out.io().is_none() => write_frame(out, &chunk, done),
                    _ => Ok(()),
                };
                (len, Some(written.map(|()| done)))
            }
        };
        cache.release();
        match done {
            None => {
                tracing::trace!(el = %tag, cached = len, "need more input");
                match finish(&tag, inp, false) {
                    JobStatus::Fail => JobStatus::Fail,
                    _ => JobStatus::Continue,
                }
            }
            Some(Err(e)) if e.is_abort() => finish(&tag, inp, false),
            Some(Err(e)) => {
                tracing::error!(el = %tag, "output failed: {e}");
                fail_released(&tag, inp)
            }
            Some(Ok(true)) => finish(&tag, inp, true),
            Some(Ok(false)) if cache.ready_for_load() => finish(&tag, inp, false),
            Some(Ok(false)) => JobStatus::Truncate,
        }
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        JobStatus::Ok
    }
}

fn write_frame(out: &mut Port, data: &[u8], done: bool) -> IoResult<()> {
    let load = out.acquire_out(data.len().max(1))?;
    load.fill_from(data).map_err(|_| IoError::Fail)?;
    load.set_done(done);
    out.release_out()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::ArgValue;
    use crate::data_bus::{DataBus, new_ringbuf};
    use crate::port::{Endpoint, PortAttr, PortDir, PortLink};
    use crate::wait::Wait;
    use std::sync::Arc;

    fn wire(el: &mut Element, src: &Arc<dyn DataBus>, dst: &Arc<dyn DataBus>) {
        el.register_in_port(Port::reader(Arc::clone(src), PortAttr::default())).unwrap();
        el.register_out_port(Port::writer(Arc::clone(dst), PortAttr::default())).unwrap();
    }

    fn drain(bus: &Arc<dyn DataBus>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let (n, last) = bus.read(&mut buf, Wait::Immediate).unwrap();
            out.extend_from_slice(&buf[..n]);
            if last || n == 0 {
                return out;
            }
        }
    }

    // --- copy ---

    #[test]
    fn copy_forwards_until_done() {
        let src = new_ringbuf(1, 64).unwrap();
        let dst = new_ringbuf(1, 64).unwrap();
        let mut el = CopyElement::element("copy", 8);
        wire(&mut el, &src, &dst);
        el.set_last(true);
        src.write(&[1; 12], true, Wait::Immediate).unwrap();

        assert_eq!(el.process_open(), JobStatus::Ok);
        assert_eq!(el.process_running(), JobStatus::Ok);
        assert_eq!(el.process_running(), JobStatus::Done);
        assert_eq!(dst.filled_size(), 12);
        assert_eq!(drain(&dst), vec![1; 12]);
    }

    #[test]
    fn copy_without_output_consumes_input() {
        let src = new_ringbuf(1, 16).unwrap();
        let mut el = CopyElement::element("sink", 4);
        el.register_in_port(Port::reader(Arc::clone(&src), PortAttr::default())).unwrap();
        el.set_last(true);
        src.write(&[2; 4], true, Wait::Immediate).unwrap();
        assert_eq!(el.process_open(), JobStatus::Ok);
        assert_eq!(el.process_running(), JobStatus::Done);
        assert_eq!(src.filled_size(), 0);
    }

    #[test]
    fn failed_output_releases_input() {
        let src = new_ringbuf(1, 16).unwrap();
        let dst = new_ringbuf(1, 4).unwrap();
        let mut el = CopyElement::element("copy", 4);
        el.register_in_port(Port::reader(Arc::clone(&src), PortAttr::default())).unwrap();
        let attr = PortAttr {
            wait: Wait::Immediate,
            ..PortAttr::default()
        };
        el.register_out_port(Port::writer(Arc::clone(&dst), attr)).unwrap();
        dst.write(&[0; 4], false, Wait::Immediate).unwrap();
        src.write(&[1; 4], false, Wait::Immediate).unwrap();

        assert_eq!(el.process_open(), JobStatus::Ok);
        assert_eq!(el.process_running(), JobStatus::Fail);
        assert!(!el.core_mut().in_port_mut().unwrap().is_held());
    }

    // --- gain ---

    #[test]
    fn gain_scales_samples() {
        let src = new_ringbuf(1, 64).unwrap();
        let dst = new_ringbuf(1, 64).unwrap();
        let mut el = GainElement::element("gain", 4, 0.0);
        wire(&mut el, &src, &dst);
        el.set_last(true);

        let method = &el.methods()[0];
        let mut args = method.args();
        args.set("db", ArgValue::F32(-6.0206)).unwrap();
        el.exec_method("set_gain", &args).unwrap();

        let mut pcm = Vec::new();
        for s in [1000i16, -1000] {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
        src.write(&pcm, true, Wait::Immediate).unwrap();
        el.process_open();
        assert_eq!(el.process_running(), JobStatus::Done);
        let out = drain(&dst);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 500);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), -500);
        assert!(el.has_cap("gain"));
    }

    #[test]
    fn gain_clamps_at_full_scale() {
        let g = GainElement::new(20.0);
        let mut pcm = i16::MAX.to_le_bytes().to_vec();
        g.apply(&mut pcm);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), i16::MAX);
    }

    // --- framer ---

    #[test]
    fn framer_truncates_until_input_drained() {
        let src = new_ringbuf(1, 64).unwrap();
        let link = PortLink::new();
        let mut el = FramerElement::element("framer", 10, 4);
        el.register_in_port(Port::reader(Arc::clone(&src), PortAttr::default())).unwrap();
        el.register_out_port(Port::new(PortDir::Out, crate::BusKind::Byte, Endpoint::Link(Arc::clone(&link)), PortAttr::default()))
            .unwrap();
        let mut next = Port::new(PortDir::In, crate::BusKind::Byte, Endpoint::Link(link), PortAttr::default());

        src.write(&[7; 10], false, Wait::Immediate).unwrap();
        assert_eq!(el.process_open(), JobStatus::Ok);

        let mut frames = Vec::new();
        let mut take = |next: &mut Port| {
            let load = next.acquire_in(4).unwrap();
            frames.push((load.valid_size(), load.is_done()));
            next.release_in().unwrap();
        };
        assert_eq!(el.process_running(), JobStatus::Truncate);
        take(&mut next);
        assert_eq!(el.process_running(), JobStatus::Truncate);
        take(&mut next);
        // Two bytes left: not a full frame and not done.
        assert_eq!(el.process_running(), JobStatus::Continue);

        src.write(&[8; 2], true, Wait::Immediate).unwrap();
        assert_eq!(el.process_running(), JobStatus::Done);
        take(&mut next);
        assert_eq!(frames, vec![(4, false), (4, false), (4, true)]);
    }
}
