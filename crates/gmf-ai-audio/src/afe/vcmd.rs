//! Voice command detection.
//!
//! Runs alongside the wake machine under its own lock. While detection is
//! armed every fetched frame goes to a [`CommandRecognizer`]; the first
//! frame also replays the pre-speech cache so a command spoken right after
//! the wake word is not clipped.

use std::time::Duration;

use gmf_core::Result;
use parking_lot::Mutex;

use super::engine::FetchResult;
use super::event::{AfeEvent, EventSink, VcmdInfo};

/// Default recogniser timeout.
pub const DEFAULT_VCMD_TIMEOUT: Duration = Duration::from_millis(5760);

/// Recogniser progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnState {
    /// Still listening.
    Detecting,
    /// A command was recognised; see [`CommandRecognizer::results`].
    Detected,
    /// Nothing recognised within the timeout.
    Timeout,
}

/// A speech command recogniser.
pub trait CommandRecognizer: Send {
    /// Consumes one frame of 16-bit little-endian mono samples.
    fn detect(&mut self, frame: &[u8]) -> MnState;

    /// Best result of the last detection.
    fn results(&self) -> VcmdInfo;

    /// Forgets partial input.
    fn clean(&mut self);
}

/// Builds a recogniser for a language and timeout.
pub type RecognizerFactory = dyn Fn(&str, Duration) -> Result<Box<dyn CommandRecognizer>> + Send + Sync;

/// Resolves a zero timeout to the default.
pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        tracing::warn!(
            default_ms = DEFAULT_VCMD_TIMEOUT.as_millis(),
            "voice command timeout configured as 0, using default"
        );
        DEFAULT_VCMD_TIMEOUT
    } else {
        timeout
    }
}

struct Inner {
    detecting: bool,
    state: MnState,
    recognizer: Box<dyn CommandRecognizer>,
}

/// Armable voice command detector.
pub struct VcmdDetector {
    inner: Mutex<Inner>,
    sink: EventSink,
}

impl std::fmt::Debug for VcmdDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VcmdDetector")
            .field("detecting", &inner.detecting)
            .field("state", &inner.state)
            .finish_non_exhaustive()
    }
}

impl VcmdDetector {
    /// Idle detector around `recognizer`.
    pub fn new(recognizer: Box<dyn CommandRecognizer>, sink: EventSink) -> Self {
        Self {
            inner: Mutex::new(Inner {
                detecting: false,
                state: MnState::Timeout,
                recognizer,
            }),
            sink,
        }
    }

    /// Whether detection is armed.
    pub fn is_detecting(&self) -> bool {
        self.inner.lock().detecting
    }

    /// Arms detection.
    pub fn begin(&self) {
        let mut inner = self.inner.lock();
        inner.detecting = true;
        inner.state = MnState::Timeout;
    }

    /// Disarms detection and drops partial input.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.detecting = false;
        inner.state = MnState::Timeout;
        inner.recognizer.clean();
    }

    /// Runs one fetched frame through the recogniser when armed.
    pub fn monitor(&self, result: &FetchResult) {
        let event = {
            let mut inner = self.inner.lock();
            if !inner.detecting {
                return;
            }
            let frame = result.data.len();
            let mut state = None;
            if inner.state != MnState::Detecting && !result.vad_cache.is_empty() && frame > 0 {
                for cached in result.vad_cache.chunks(frame) {
                    let s = inner.recognizer.detect(cached);
                    if s == MnState::Detected {
                        state = Some(s);
                        break;
                    }
                    inner.state = s;
                }
            }
            let state = state.unwrap_or_else(|| inner.recognizer.detect(&result.data));
            inner.state = state;
            match state {
                MnState::Detected => Some(AfeEvent::VcmdDetected(inner.recognizer.results())),
                MnState::Timeout => {
                    inner.detecting = false;
                    Some(AfeEvent::VcmdTimeout)
                }
                MnState::Detecting => None,
            }
        };
        if let Some(ev) = event {
            tracing::debug!(event = ev.name(), id = ev.id(), "voice command");
            (self.sink)(&ev);
        }
    }
}

/// Recogniser without a command model: never detects, and times out after
/// `timeout` of 16 kHz mono audio.
#[derive(Debug)]
pub struct SilentRecognizer {
    limit: usize,
    heard: usize,
}

impl SilentRecognizer {
    /// Recogniser that times out after `timeout` of audio.
    pub fn new(timeout: Duration) -> Self {
        let ms = usize::try_from(timeout.as_millis()).unwrap_or(usize::MAX);
        Self {
            limit: ms.saturating_mul(32),
            heard: 0,
        }
    }
}

impl CommandRecognizer for SilentRecognizer {
    fn detect(&mut self, frame: &[u8]) -> MnState {
        self.heard += frame.len();
        if self.heard >= self.limit {
            self.heard = 0;
            MnState::Timeout
        } else {
            MnState::Detecting
        }
    }

    fn results(&self) -> VcmdInfo {
        VcmdInfo::new(-1, 0.0, "")
    }

    fn clean(&mut self) {
        self.heard = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Recognises phrase 3 when a frame starts with 0x7f.
    struct Marker {
        seen: usize,
        budget: usize,
    }

    impl CommandRecognizer for Marker {
        fn detect(&mut self, frame: &[u8]) -> MnState {
            self.seen += 1;
            if frame.first() == Some(&0x7f) {
                MnState::Detected
            } else if self.seen >= self.budget {
                MnState::Timeout
            } else {
                MnState::Detecting
            }
        }

        fn results(&self) -> VcmdInfo {
            VcmdInfo::new(3, 0.8, "turn on the light")
        }

        fn clean(&mut self) {
            self.seen = 0;
        }
    }

    fn detector(budget: usize) -> (VcmdDetector, Arc<Mutex<Vec<AfeEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let d = VcmdDetector::new(
            Box::new(Marker {
                seen: 0,
                budget,
            }),
            Arc::new(move |e: &AfeEvent| sink.lock().push(e.clone())),
        );
        (d, events)
    }

    fn frame(first: u8, cache: Vec<u8>) -> FetchResult {
        let mut data = vec![0u8; 4];
        data[0] = first;
        FetchResult {
            data,
            vad_cache: cache,
            ..FetchResult::default()
        }
    }

    #[test]
    fn idle_detector_ignores_frames() {
        let (d, events) = detector(10);
        d.monitor(&frame(0x7f, Vec::new()));
        assert!(events.lock().is_empty());
    }

    #[test]
    fn detects_in_live_frame() {
        let (d, events) = detector(10);
        d.begin();
        d.monitor(&frame(0, Vec::new()));
        d.monitor(&frame(0x7f, Vec::new()));
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), 3);
        assert!(d.is_detecting());
    }

    #[test]
    fn replays_cache_before_live_frame() {
        let (d, events) = detector(10);
        d.begin();
        let cache = vec![0, 0, 0, 0, 0x7f, 0, 0, 0];
        d.monitor(&frame(0, cache));
        assert!(matches!(events.lock()[0], AfeEvent::VcmdDetected(_)));
    }

    #[test]
    fn timeout_disarms() {
        let (d, events) = detector(2);
        d.begin();
        d.monitor(&frame(0, Vec::new()));
        d.monitor(&frame(0, Vec::new()));
        assert_eq!(*events.lock(), [AfeEvent::VcmdTimeout]);
        assert!(!d.is_detecting());
        d.monitor(&frame(0x7f, Vec::new()));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn cancel_cleans_recognizer() {
        let (d, events) = detector(2);
        d.begin();
        d.monitor(&frame(0, Vec::new()));
        d.cancel();
        assert!(!d.is_detecting());

        d.begin();
        d.monitor(&frame(0, Vec::new()));
        assert!(events.lock().is_empty());
        d.monitor(&frame(0, Vec::new()));
        assert_eq!(*events.lock(), [AfeEvent::VcmdTimeout]);
    }

    #[test]
    fn silent_recognizer_times_out_after_its_budget() {
        let mut r = SilentRecognizer::new(Duration::from_millis(64));
        // 64 ms of 16 kHz mono is 2048 bytes
        assert_eq!(r.detect(&[0; 1024]), MnState::Detecting);
        assert_eq!(r.detect(&[0; 1024]), MnState::Timeout);
    }

    #[test]
    fn zero_timeout_uses_default() {
        assert_eq!(effective_timeout(Duration::ZERO), DEFAULT_VCMD_TIMEOUT);
        assert_eq!(effective_timeout(Duration::from_secs(2)), Duration::from_secs(2));
    }
}
