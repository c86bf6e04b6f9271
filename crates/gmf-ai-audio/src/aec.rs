//! Echo cancellation element.
//!
//! [`AecElement`] feeds an [`AecEngine`] whole frames of capture sorted
//! microphones first, references after, and forwards the cleaned 16 kHz mono
//! signal. [`NlmsAec`] is the reference engine.

use std::collections::VecDeque;

use gmf_core::{
    Capability, Element, ElementConfig, ElementCore, ElementOps, Error, EventPacket, JobStatus, PayloadCache, Result,
};

use crate::frame::{ChannelFormat, SAMPLE_BYTES, check_format, mono_info, process_frame, to_bytes, to_samples};

/// An echo canceller consuming fixed chunks.
pub trait AecEngine: Send {
    /// Samples per channel consumed by one [`process`](Self::process).
    fn chunk_size(&self) -> usize;

    /// Cleans one chunk of interleaved capture laid out as `format`
    /// describes after sorting, writing `out.len()` mono samples.
    fn process(&mut self, frame: &[i16], format: &ChannelFormat, out: &mut [i16]);

    /// Forgets the adapted echo path.
    fn reset(&mut self) {}
}

const NLMS_EPS: f32 = 1e-6;

/// Normalised LMS canceller on the first microphone against the first
/// reference. Without a reference channel the microphone passes unchanged.
#[derive(Debug)]
pub struct NlmsAec {
    chunk_size: usize,
    step: f32,
    weights: Vec<f32>,
    history: VecDeque<f32>,
}

impl NlmsAec {
    /// Canceller with `taps` filter coefficients adapting at `step`
    /// (0 < step <= 1).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero size or a step outside (0, 1].
    pub fn new(chunk_size: usize, taps: usize, step: f32) -> Result<Self> {
        if chunk_size == 0 || taps == 0 {
            return Err(Error::invalid_arg("chunk size and filter length must be non-zero"));
        }
        if !(step > 0.0 && step <= 1.0) {
            return Err(Error::invalid_arg(format!("adaptation step {step}")));
        }
        Ok(Self {
            chunk_size,
            step,
            weights: vec![0.0; taps],
            history: std::iter::repeat_n(0.0, taps).collect(),
        })
    }

    fn cancel(&mut self, mic: f32, reference: f32) -> f32 {
        self.history.pop_back();
        self.history.push_front(reference);
        let estimate: f32 = self.weights.iter().zip(&self.history).map(|(w, x)| w * x).sum();
        let power: f32 = self.history.iter().map(|x| x * x).sum();
        let err = mic - estimate;
        let gain = self.step * err / (power + NLMS_EPS);
        for (w, x) in self.weights.iter_mut().zip(&self.history) {
            *w += gain * x;
        }
        err
    }
}

fn to_unit(s: i16) -> f32 {
    f32::from(s) / 32768.0
}

fn from_unit(v: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let s = (v * 32768.0).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    s
}

impl AecEngine for NlmsAec {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn process(&mut self, frame: &[i16], format: &ChannelFormat, out: &mut [i16]) {
        let stride = format.channels();
        let reference = (format.refs() > 0).then_some(format.mics());
        for (point, slot) in frame.chunks_exact(stride).zip(out.iter_mut()) {
            *slot = match reference {
                Some(r) => from_unit(self.cancel(to_unit(point[0]), to_unit(point[r]))),
                None => point[0],
            };
        }
    }

    fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Echo cancellation as a pipeline element.
pub struct AecElement {
    engine: Box<dyn AecEngine>,
    format: ChannelFormat,
    cache: Option<PayloadCache>,
    frame_len: usize,
    samples: Vec<i16>,
    sorted: Vec<i16>,
    clean: Vec<i16>,
    out_buf: Vec<u8>,
}

impl std::fmt::Debug for AecElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AecElement")
            .field("format", &self.format.as_str())
            .field("frame_len", &self.frame_len)
            .finish_non_exhaustive()
    }
}

impl AecElement {
    /// Element reading capture laid out as `input_format`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a malformed format.
    pub fn new(input_format: &str, engine: Box<dyn AecEngine>) -> Result<Self> {
        Ok(Self {
            engine,
            format: ChannelFormat::parse(input_format)?,
            cache: None,
            frame_len: 0,
            samples: Vec::new(),
            sorted: Vec::new(),
            clean: Vec::new(),
            out_buf: Vec::new(),
        })
    }

    /// Wraps into a pipeline element that opens once upstream reports its
    /// format.
    pub fn into_element(self, tag: &str) -> Element {
        let config = ElementConfig {
            alignment: 16,
            dependency: true,
            ..ElementConfig::default()
        };
        Element::new(tag, config, Box::new(self))
    }
}

impl ElementOps for AecElement {
    fn open(&mut self, core: &mut ElementCore) -> JobStatus {
        let chunk = self.engine.chunk_size();
        self.frame_len = chunk * self.format.channels() * SAMPLE_BYTES;
        match PayloadCache::new(self.frame_len) {
            Ok(cache) => self.cache = Some(cache),
            Err(e) => {
                tracing::error!(el = %core.tag(), frame_len = self.frame_len, "cache allocation failed: {e}");
                return JobStatus::Fail;
            }
        }
        self.clean.resize(chunk, 0);
        self.engine.reset();
        tracing::info!(
            el = %core.tag(),
            frame_len = self.frame_len,
            format = self.format.as_str(),
            chunk,
            "echo canceller open"
        );
        core.notify_info(mono_info());
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let tag = core.tag().to_owned();
        let Self {
            engine,
            format,
            cache,
            frame_len,
            samples,
            sorted,
            clean,
            out_buf,
        } = self;
        let (Some(cache), (Some(inp), out)) = (cache.as_mut(), core.ports_mut()) else {
            return JobStatus::Fail;
        };
        process_frame(&tag, cache, inp, out, *frame_len, out_buf, |frame, out_bytes| {
            to_samples(frame, samples);
            sorted.resize(samples.len(), 0);
            format.sort(samples, sorted);
            engine.process(sorted, format, clean);
            to_bytes(clean, out_bytes);
        })
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        self.cache = None;
        JobStatus::Ok
    }

    fn on_event(&mut self, core: &mut ElementCore, event: &EventPacket) -> Result<()> {
        check_format(core.tag(), event)
    }

    fn caps(&self) -> Vec<Capability> {
        vec![Capability::new("AEC")]
    }
}
