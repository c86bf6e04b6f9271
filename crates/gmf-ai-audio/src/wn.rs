//! Wake word element.
//!
//! [`WnElement`] cuts capture into the frame size of a [`WakeNetEngine`],
//! puts the channels in microphone-first order and runs detection on every
//! frame. The first microphone channel goes downstream as 16 kHz mono.

use gmf_core::{
    Capability, Element, ElementConfig, ElementCore, ElementOps, Error, EventPacket, JobStatus, PayloadCache, Result,
};

use crate::afe::rms;
use crate::frame::{ChannelFormat, SAMPLE_BYTES, check_format, mono_info, process_frame, to_bytes, to_samples};

/// A wake word detector consuming fixed chunks.
pub trait WakeNetEngine: Send {
    /// Samples per channel consumed by one [`detect`](Self::detect).
    fn chunk_size(&self) -> usize;

    /// Microphone channels the detector listens to.
    fn channels(&self) -> usize;

    /// Runs detection on one chunk of interleaved capture with `stride`
    /// channels per sample point, microphones first.
    ///
    /// Returns the triggering microphone channel when a wake word ends in
    /// this chunk.
    fn detect(&mut self, frame: &[i16], stride: usize) -> Option<usize>;

    /// Forgets detection history.
    fn reset(&mut self) {}
}

/// Tuning for [`EnergyWakeEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyWakeConfig {
    /// Samples per channel per chunk.
    pub chunk_size: usize,
    /// Microphones compared for the trigger channel.
    pub channels: usize,
    /// RMS threshold on samples normalised to [-1, 1].
    pub threshold: f32,
    /// Consecutive loud chunks that make a detection.
    pub min_chunks: usize,
}

impl Default for EnergyWakeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            channels: 1,
            threshold: 0.2,
            min_chunks: 3,
        }
    }
}

/// Reference detector: a burst of `min_chunks` loud chunks counts as a wake
/// word, attributed to the loudest microphone. One burst fires once.
#[derive(Debug)]
pub struct EnergyWakeEngine {
    config: EnergyWakeConfig,
    run: usize,
    voice: Vec<i16>,
}

impl EnergyWakeEngine {
    /// Builds a detector.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero size or count, or a negative
    /// threshold.
    pub fn new(config: EnergyWakeConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.channels == 0 || config.min_chunks == 0 {
            return Err(Error::invalid_arg("chunk size, channels and burst length must be non-zero"));
        }
        if config.threshold.is_nan() || config.threshold < 0.0 {
            return Err(Error::invalid_arg(format!("threshold {}", config.threshold)));
        }
        Ok(Self {
            voice: Vec::with_capacity(config.chunk_size),
            config,
            run: 0,
        })
    }
}

impl WakeNetEngine for EnergyWakeEngine {
    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn channels(&self) -> usize {
        self.config.channels
    }

    fn detect(&mut self, frame: &[i16], stride: usize) -> Option<usize> {
        let mut loudest = (0, 0.0f32);
        for ch in 0..self.config.channels.min(stride) {
            self.voice.clear();
            self.voice.extend(frame.iter().skip(ch).step_by(stride).copied());
            let level = rms(&self.voice);
            if level > loudest.1 {
                loudest = (ch, level);
            }
        }
        if loudest.1 > self.config.threshold {
            self.run = self.run.saturating_add(1);
        } else {
            self.run = 0;
        }
        (self.run == self.config.min_chunks).then_some(loudest.0)
    }

    fn reset(&mut self) {
        self.run = 0;
    }
}

/// Called with the triggering microphone channel on each detection.
pub type DetectCb = Box<dyn FnMut(usize) + Send>;

/// Wake word detection as a pipeline element.
pub struct WnElement {
    engine: Box<dyn WakeNetEngine>,
    format: ChannelFormat,
    detect_cb: Option<DetectCb>,
    cache: Option<PayloadCache>,
    frame_len: usize,
    samples: Vec<i16>,
    sorted: Vec<i16>,
    mono: Vec<i16>,
    out_buf: Vec<u8>,
}

impl std::fmt::Debug for WnElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WnElement")
            .field("format", &self.format.as_str())
            .field("frame_len", &self.frame_len)
            .finish_non_exhaustive()
    }
}

impl WnElement {
    /// Element reading capture laid out as `input_format`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a malformed format.
    pub fn new(input_format: &str, engine: Box<dyn WakeNetEngine>) -> Result<Self> {
        Ok(Self {
            engine,
            format: ChannelFormat::parse(input_format)?,
            detect_cb: None,
            cache: None,
            frame_len: 0,
            samples: Vec::new(),
            sorted: Vec::new(),
            mono: Vec::new(),
            out_buf: Vec::new(),
        })
    }

    /// Installs or removes the detection callback.
    pub fn set_detect_cb(&mut self, cb: Option<DetectCb>) {
        self.detect_cb = cb;
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

impl ElementOps for WnElement {
    fn open(&mut self, core: &mut ElementCore) -> JobStatus {
        let needed = self.engine.channels();
        if needed > self.format.mics() {
            tracing::error!(
                el = %core.tag(),
                format = self.format.as_str(),
                needed,
                "input has fewer microphones than the detector needs"
            );
            return JobStatus::Fail;
        }
        let chunk = self.engine.chunk_size();
        self.frame_len = chunk * self.format.channels() * SAMPLE_BYTES;
        match PayloadCache::new(self.frame_len) {
            Ok(cache) => self.cache = Some(cache),
            Err(e) => {
                tracing::error!(el = %core.tag(), frame_len = self.frame_len, "cache allocation failed: {e}");
                return JobStatus::Fail;
            }
        }
        self.engine.reset();
        tracing::info!(
            el = %core.tag(),
            frame_len = self.frame_len,
            channels = self.format.channels(),
            chunk,
            "wake word open"
        );
        core.notify_info(mono_info());
        JobStatus::Ok
    }

    fn process(&mut self, core: &mut ElementCore) -> JobStatus {
        let tag = core.tag().to_owned();
        let Self {
            engine,
            format,
            detect_cb,
            cache,
            frame_len,
            samples,
            sorted,
            mono,
            out_buf,
        } = self;
        let (Some(cache), (Some(inp), out)) = (cache.as_mut(), core.ports_mut()) else {
            return JobStatus::Fail;
        };
        process_frame(&tag, cache, inp, out, *frame_len, out_buf, |frame, out_bytes| {
            to_samples(frame, samples);
            sorted.resize(samples.len(), 0);
            format.sort(samples, sorted);
            let stride = format.channels();
            if let Some(ch) = engine.detect(sorted, stride) {
                tracing::info!(el = %tag, channel = ch, "wake word detected");
                if let Some(cb) = detect_cb.as_mut() {
                    cb(ch);
                }
            }
            mono.clear();
            mono.extend(sorted.iter().step_by(stride).copied());
            to_bytes(mono, out_bytes);
        })
    }

    fn close(&mut self, _core: &mut ElementCore) -> JobStatus {
        self.cache = None;
        self.engine.reset();
        JobStatus::Ok
    }

    fn on_event(&mut self, core: &mut ElementCore, event: &EventPacket) -> Result<()> {
        check_format(core.tag(), event)
    }

    fn caps(&self) -> Vec<Capability> {
        vec![Capability::new("WWE")]
    }
}
