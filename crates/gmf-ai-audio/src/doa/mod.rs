//! Direction of arrival for a two-microphone pair inside 4-channel capture.
//!
//! - [`GccPhatEstimator`] - the per-frame estimate behind [`DirectionEstimator`]
//! - [`DoaProcessor`] - de-interleave, estimate, smooth and calibrate a chunk
//! - [`AudioDoa`] - a processor on its own thread fed through a ring
//! - [`DoaTracker`] - voice-gated smoothing of the resulting angles
//! - [`DoaElement`] - a processor as a pipeline element

mod element;
mod estimator;
mod gcc_phat;
mod tracker;

pub use element::DoaElement;
pub use estimator::{
    AudioDoa, CAPTURE_CHANNELS, DoaCallback, DoaConfig, DoaProcessor, DoaState, HISTORY_LEN, HISTORY_SIGMA,
    MIC_OFFSETS,
};
pub use gcc_phat::{DirectionEstimator, GccPhatEstimator, GccPhatParams, SPEED_OF_SOUND, calibrate, gaussian_weights};
pub use tracker::{
    DISCARD_RATIO, DoaTracker, MIN_SAMPLES_FOR_UPDATE, TRACKER_BUF_LEN, TrackerCallback, TrackerConfig, robust_mean,
};
