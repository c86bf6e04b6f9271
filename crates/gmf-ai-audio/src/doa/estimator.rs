//! Background direction-of-arrival estimation over a capture ring.
//!
//! Capture is pushed with [`AudioDoa::data_write`] into a ring bus; a worker
//! thread pulls fixed chunks at its own pace, so the writer never waits on
//! the FFT. Each chunk is de-interleaved, estimated, smoothed over a short
//! Gaussian history and calibrated before reaching the result callback.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use gmf_core::{DataBus, Error, IoError, Result, Wait, new_ringbuf};
use parking_lot::{Condvar, Mutex};

use super::gcc_phat::{DirectionEstimator, GccPhatEstimator, GccPhatParams, calibrate, gaussian_weights};

/// Interleaved channels in a capture frame.
pub const CAPTURE_CHANNELS: usize = 4;
/// Offsets of the left and right microphones inside a capture frame.
pub const MIC_OFFSETS: (usize, usize) = (1, 3);
/// Length of the smoothing history.
pub const HISTORY_LEN: usize = 7;
/// Spread of the smoothing window, in history slots.
pub const HISTORY_SIGMA: f32 = 1.0;

const START_POLL: Duration = Duration::from_millis(10);
const READ_WAIT: Duration = Duration::from_millis(10);
const WRITE_WAIT_MS: u64 = 10;

/// Receives calibrated angles in degrees.
pub type DoaCallback = Box<dyn Fn(f32) + Send + Sync>;

/// Settings for [`AudioDoa`] and [`DoaProcessor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DoaConfig {
    /// Sample rate of the capture in Hz.
    pub sample_rate: u32,
    /// Angle grid step in degrees.
    pub resolution_deg: f32,
    /// Spacing of the microphone pair in metres.
    pub mic_distance: f32,
    /// Bytes of interleaved capture per estimate.
    pub chunk_bytes: usize,
    /// Ring capacity in chunks.
    pub ring_chunks: usize,
}

impl Default for DoaConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            resolution_deg: 10.0,
            mic_distance: 0.06,
            chunk_bytes: 2048,
            ring_chunks: 3,
        }
    }
}

impl DoaConfig {
    /// Samples per microphone in one chunk.
    pub fn frame_size(&self) -> usize {
        self.chunk_bytes / (2 * CAPTURE_CHANNELS)
    }

    fn estimator_params(&self) -> GccPhatParams {
        GccPhatParams {
            sample_rate: self.sample_rate,
            resolution_deg: self.resolution_deg,
            mic_distance: self.mic_distance,
            frame_size: self.frame_size(),
        }
    }
}

/// Worker status of an [`AudioDoa`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DoaState {
    /// Not started, or stopped.
    #[default]
    Idle,
    /// Consuming capture.
    Running,
    /// The capture ring failed; restart to retry.
    Error,
}

/// Estimate, smoothing and calibration for one chunk at a time.
pub struct DoaProcessor {
    estimator: Box<dyn DirectionEstimator>,
    weights: Vec<f32>,
    history: Vec<f32>,
    cursor: usize,
    primed: bool,
    left: Vec<i16>,
    right: Vec<i16>,
}

impl std::fmt::Debug for DoaProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoaProcessor")
            .field("history", &self.history)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl DoaProcessor {
    /// Processor around the default GCC-PHAT estimator.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] when the chunk holds no whole frame or the
    /// estimator rejects the geometry.
    pub fn new(config: &DoaConfig) -> Result<Self> {
        if config.frame_size() == 0 {
            return Err(Error::invalid_arg(format!("chunk of {} bytes", config.chunk_bytes)));
        }
        let estimator = GccPhatEstimator::new(config.estimator_params())?;
        Ok(Self::with_estimator(Box::new(estimator)))
    }

    /// Processor around a custom estimator.
    pub fn with_estimator(estimator: Box<dyn DirectionEstimator>) -> Self {
        let frame = estimator.frame_size();
        Self {
            estimator,
            weights: gaussian_weights(HISTORY_LEN, HISTORY_SIGMA),
            history: vec![0.0; HISTORY_LEN],
            cursor: 0,
            primed: false,
            left: Vec::with_capacity(frame),
            right: Vec::with_capacity(frame),
        }
    }

    /// Forgets the smoothing history.
    pub fn reset(&mut self) {
        self.primed = false;
        self.cursor = 0;
    }

    /// Turns one chunk of interleaved 16-bit capture into a calibrated angle.
    pub fn process_chunk(&mut self, interleaved: &[u8]) -> f32 {
        self.left.clear();
        self.right.clear();
        let stride = 2 * CAPTURE_CHANNELS;
        for frame in interleaved.chunks_exact(stride) {
            let l = 2 * MIC_OFFSETS.0;
            let r = 2 * MIC_OFFSETS.1;
            self.left.push(i16::from_le_bytes([frame[l], frame[l + 1]]));
            self.right.push(i16::from_le_bytes([frame[r], frame[r + 1]]));
        }
        let raw = self.estimator.process(&self.left, &self.right);
        calibrate(self.smooth(raw))
    }

    /// Pushes a raw estimate and returns the weighted average of the
    /// history, newest sample weighted by the first tap.
    fn smooth(&mut self, raw: f32) -> f32 {
        if self.primed {
            self.cursor = (self.cursor + 1) % HISTORY_LEN;
            self.history[self.cursor] = raw;
        } else {
            self.history.fill(raw);
            self.cursor = 0;
            self.primed = true;
        }
        self.weights
            .iter()
            .enumerate()
            .map(|(i, w)| self.history[(self.cursor + HISTORY_LEN - i) % HISTORY_LEN] * w)
            .sum()
    }
}

#[derive(Debug, Default)]
struct Ctrl {
    started: bool,
    quit: bool,
    state: DoaState,
}

struct Shared {
    bus: Arc<dyn DataBus>,
    ctrl: Mutex<Ctrl>,
    ctrl_cv: Condvar,
    callback: ArcSwapOption<DoaCallback>,
    chunk_bytes: usize,
}

/// Direction-of-arrival estimator running on its own thread.
pub struct AudioDoa {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AudioDoa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDoa")
            .field("state", &self.shared.ctrl.lock().state)
            .field("chunk_bytes", &self.shared.chunk_bytes)
            .finish_non_exhaustive()
    }
}

impl AudioDoa {
    /// Creates the ring, the processor and the idle worker.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero ring or a bad geometry;
    /// [`Error::Fail`] when the worker thread cannot be spawned.
    pub fn new(config: DoaConfig) -> Result<Self> {
        if config.ring_chunks == 0 {
            return Err(Error::invalid_arg("ring must hold at least one chunk"));
        }
        let processor = DoaProcessor::new(&config)?;
        let bus = new_ringbuf(1, config.chunk_bytes * config.ring_chunks)?;
        let shared = Arc::new(Shared {
            bus,
            ctrl: Mutex::new(Ctrl::default()),
            ctrl_cv: Condvar::new(),
            callback: ArcSwapOption::empty(),
            chunk_bytes: config.chunk_bytes,
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("audio_doa".into())
                .spawn(move || worker_loop(&shared, processor))
                .map_err(|e| Error::fail(format!("spawn doa worker: {e}")))?
        };
        tracing::info!(
            sample_rate = config.sample_rate,
            chunk_bytes = config.chunk_bytes,
            "doa created"
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Installs or clears the result callback.
    pub fn set_result_callback(&self, callback: Option<DoaCallback>) {
        self.shared.callback.store(callback.map(Arc::new));
    }

    /// Lets the worker consume capture.
    pub fn start(&self) -> Result<()> {
        self.shared.ctrl.lock().started = true;
        self.shared.ctrl_cv.notify_all();
        tracing::debug!("doa started");
        Ok(())
    }

    /// Parks the worker; capture already written stays in the ring.
    pub fn stop(&self) -> Result<()> {
        {
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.started = false;
            ctrl.state = DoaState::Idle;
        }
        tracing::debug!("doa stopped");
        Ok(())
    }

    /// Current worker status.
    pub fn state(&self) -> DoaState {
        self.shared.ctrl.lock().state
    }

    /// Bytes of capture waiting in the ring.
    pub fn pending(&self) -> usize {
        self.shared.bus.filled_size()
    }

    /// Appends interleaved 4-channel 16-bit capture.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for empty input; [`Error::Fail`] when the ring
    /// cannot take the bytes within 10 ms.
    pub fn data_write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::invalid_arg("empty doa input"));
        }
        self.shared.bus.write(data, false, Wait::ms(WRITE_WAIT_MS)).map_err(|e| {
            tracing::error!(len = data.len(), "doa write failed: {e}");
            Error::fail(format!("doa write: {e}"))
        })
    }
}

impl Drop for AudioDoa {
    fn drop(&mut self) {
        {
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.started = false;
            ctrl.quit = true;
        }
        self.shared.ctrl_cv.notify_all();
        self.shared.bus.abort();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("doa worker panicked");
            }
        }
    }
}

enum Tick {
    Parked,
    Resumed,
    Running,
}

/// Waits up to one poll period for the start bit; `None` once asked to quit.
fn wait_started(shared: &Shared) -> Option<Tick> {
    let mut ctrl = shared.ctrl.lock();
    if !ctrl.started && !ctrl.quit {
        shared.ctrl_cv.wait_for(&mut ctrl, START_POLL);
    }
    if ctrl.quit {
        return None;
    }
    if !ctrl.started {
        return Some(Tick::Parked);
    }
    if ctrl.state == DoaState::Running {
        Some(Tick::Running)
    } else {
        ctrl.state = DoaState::Running;
        Some(Tick::Resumed)
    }
}

fn fail(shared: &Shared) {
    let mut ctrl = shared.ctrl.lock();
    ctrl.started = false;
    ctrl.state = DoaState::Error;
}

fn worker_loop(shared: &Shared, mut processor: DoaProcessor) {
    let mut chunk = vec![0u8; shared.chunk_bytes];
    while let Some(tick) = wait_started(shared) {
        match tick {
            Tick::Parked => continue,
            Tick::Resumed => processor.reset(),
            Tick::Running => {}
        }
        // Only whole chunks are read so a timeout never splits one
        if shared.bus.filled_size() < shared.chunk_bytes {
            thread::sleep(READ_WAIT);
            continue;
        }
        match shared.bus.read(&mut chunk, Wait::For(READ_WAIT)) {
            Ok((n, _)) if n == chunk.len() => {}
            Ok((n, _)) => {
                tracing::warn!(n, "short doa chunk dropped");
                continue;
            }
            Err(IoError::Abort) => {
                tracing::debug!("doa ring aborted");
                continue;
            }
            Err(IoError::Timeout) => continue,
            Err(e) => {
                tracing::error!("doa ring read failed: {e}");
                fail(shared);
                continue;
            }
        }
        let angle = processor.process_chunk(&chunk);
        tracing::trace!(angle, "doa estimate");
        if let Some(cb) = shared.callback.load_full() {
            cb(angle);
        }
    }
    tracing::debug!("doa worker exit");
}
