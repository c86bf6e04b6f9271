//! Turns a jittery stream of angles into occasional, stable updates.
//!
//! Angles are only collected while voice is active. A periodic timer takes
//! a trimmed mean of the collected angles and folds it into an exponential
//! filter: slowly for small moves, quickly for large moves backed by enough
//! samples. An update is published only when the filtered angle has moved by
//! half the large-move threshold since the last one. The first tick after
//! voice starts publishes the mean directly.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use gmf_core::{Error, Result};
use parking_lot::Mutex;

use crate::timer::SoftTimer;

/// Angles kept for the trimmed mean.
pub const TRACKER_BUF_LEN: usize = 128;
/// Fraction of samples discarded at each end before averaging.
pub const DISCARD_RATIO: f32 = 0.1;
/// Samples needed before a regular update.
pub const MIN_SAMPLES_FOR_UPDATE: usize = 3;

/// Receives published angles in degrees.
pub type TrackerCallback = Box<dyn Fn(f32) + Send + Sync>;

/// Filter tuning for a [`DoaTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Filter weight for small moves.
    pub slow_alpha: f32,
    /// Filter weight for large moves backed by enough samples.
    pub fast_alpha: f32,
    /// Move in degrees that counts as large.
    pub large_diff_deg: f32,
    /// Timer period.
    pub update_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            slow_alpha: 0.15,
            fast_alpha: 0.6,
            large_diff_deg: 12.0,
            update_interval: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Default)]
struct TrackState {
    filtered: f32,
    last_sent: f32,
    vad_active: bool,
    vad_just_started: bool,
    samples: VecDeque<f32>,
}

/// Mean of the sorted samples with the top and bottom tenth discarded.
pub fn robust_mean(samples: &[f32]) -> f32 {
    let n = samples.len();
    if n == 0 {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f32::total_cmp);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let mut discard = (n as f32 * DISCARD_RATIO) as usize;
    if discard * 2 >= n {
        discard = 0;
    }
    let kept = &sorted[discard..n - discard];
    #[allow(clippy::cast_precision_loss)]
    let mean = kept.iter().sum::<f32>() / kept.len() as f32;
    mean
}

/// VAD-gated angle smoother with a periodic publisher.
pub struct DoaTracker {
    config: TrackerConfig,
    state: Mutex<TrackState>,
    on_update: TrackerCallback,
    timer: SoftTimer,
}

impl std::fmt::Debug for DoaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoaTracker")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DoaTracker {
    /// Tracker publishing through `on_update`. The timer stays idle until
    /// [`start`](Self::start).
    pub fn new(config: TrackerConfig, on_update: TrackerCallback) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me = me.clone();
            Self {
                config,
                state: Mutex::new(TrackState::default()),
                on_update,
                timer: SoftTimer::new("doa_timer", move || {
                    if let Some(tracker) = me.upgrade() {
                        tracker.tick();
                    }
                }),
            }
        })
    }

    /// Tracker with the default tuning.
    pub fn with_defaults(on_update: TrackerCallback) -> Arc<Self> {
        Self::new(TrackerConfig::default(), on_update)
    }

    /// Filter tuning.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Starts periodic publishing.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero update interval.
    pub fn start(&self) -> Result<()> {
        if self.config.update_interval.is_zero() {
            return Err(Error::invalid_arg("tracker interval must be non-zero"));
        }
        self.timer.start_periodic(self.config.update_interval)
    }

    /// Stops periodic publishing.
    pub fn stop(&self) {
        self.timer.stop();
    }

    /// Voice activity edge. A rising edge drops the collected angles and
    /// arms the quick sync.
    pub fn set_vad_state(&self, active: bool) {
        let mut st = self.state.lock();
        if active && !st.vad_active {
            st.vad_active = true;
            st.vad_just_started = true;
            st.samples.clear();
        } else if !active {
            st.vad_active = false;
        }
    }

    /// Collects one angle, clamped to [0, 180]. Ignored without voice.
    pub fn feed(&self, angle: f32) {
        let angle = angle.clamp(0.0, 180.0);
        let mut st = self.state.lock();
        if !st.vad_active {
            return;
        }
        if st.samples.len() == TRACKER_BUF_LEN {
            st.samples.pop_front();
        }
        st.samples.push_back(angle);
    }

    /// Last published angle.
    pub fn last_sent(&self) -> f32 {
        self.state.lock().last_sent
    }

    /// Runs one update; returns the published angle, if any.
    pub fn tick(&self) -> Option<f32> {
        let publish = {
            let mut st = self.state.lock();
            let count = st.samples.len();
            if !st.vad_active || count == 0 {
                return None;
            }
            if count < MIN_SAMPLES_FOR_UPDATE && !st.vad_just_started {
                return None;
            }
            let sample = robust_mean(st.samples.make_contiguous()).clamp(0.0, 180.0);
            let diff = (sample - st.filtered).abs();

            if st.vad_just_started {
                st.vad_just_started = false;
                st.filtered = sample;
                st.last_sent = sample;
                tracing::info!(angle = sample, "voice start: doa quick sync");
                Some(sample)
            } else {
                let alpha = if diff < self.config.large_diff_deg {
                    self.config.slow_alpha
                } else if count >= MIN_SAMPLES_FOR_UPDATE * 2 {
                    self.config.fast_alpha
                } else {
                    (self.config.slow_alpha + self.config.fast_alpha) * 0.5
                };
                st.filtered = alpha * sample + (1.0 - alpha) * st.filtered;
                if (st.filtered - st.last_sent).abs() >= self.config.large_diff_deg * 0.5 {
                    st.last_sent = st.filtered;
                    tracing::debug!(angle = st.filtered, sample, diff, "doa update");
                    Some(st.filtered)
                } else {
                    None
                }
            }
        };
        if let Some(angle) = publish {
            (self.on_update)(angle);
        }
        publish
    }
}

impl Drop for DoaTracker {
    fn drop(&mut self) {
        self.timer.stop();
    }
}
