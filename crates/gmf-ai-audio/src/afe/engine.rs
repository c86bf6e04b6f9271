//! The audio front-end engine seam.
//!
//! An [`AfeEngine`] consumes interleaved multi-channel capture in fixed
//! chunks and produces processed mono frames annotated with voice activity
//! and wake-word detections. The [`AfeManager`](super::AfeManager) drives an
//! engine from two threads; [`EnergyVadEngine`](super::EnergyVadEngine) is
//! the reference implementation.

use gmf_core::Result;

/// Voice activity of a fetched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    /// No speech in this frame.
    #[default]
    Silence,
    /// Speech in this frame.
    Speech,
}

/// Switchable engine stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Wake-word detection.
    WakeNet,
    /// Voice activity detection.
    Vad,
    /// Acoustic echo cancellation.
    Aec,
    /// Speech enhancement.
    Se,
}

/// Which engine stages are currently enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    /// Wake-word detection.
    pub wakeup: bool,
    /// Voice activity detection.
    pub vad: bool,
    /// Noise suppression.
    pub ns: bool,
    /// Acoustic echo cancellation.
    pub aec: bool,
    /// Speech enhancement.
    pub se: bool,
}

impl Features {
    /// State of one feature.
    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::WakeNet => self.wakeup,
            Feature::Vad => self.vad,
            Feature::Aec => self.aec,
            Feature::Se => self.se,
        }
    }

    /// Sets one feature.
    pub fn set(&mut self, feature: Feature, enable: bool) {
        match feature {
            Feature::WakeNet => self.wakeup = enable,
            Feature::Vad => self.vad = enable,
            Feature::Aec => self.aec = enable,
            Feature::Se => self.se = enable,
        }
    }
}

/// Details of a wake-word detection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WakeupInfo {
    /// Frame volume in dBFS.
    pub data_volume: f32,
    /// Wake word index, starting at 1.
    pub wake_word_index: i32,
    /// Wake model index, starting at 1.
    pub wakenet_model_index: i32,
}

/// One processed frame.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Processed 16-bit little-endian mono samples.
    pub data: Vec<u8>,
    /// Voice activity of this frame.
    pub vad_state: VadState,
    /// Set when a wake word ended in this frame.
    pub wakeup: Option<WakeupInfo>,
    /// Frame volume in dBFS.
    pub data_volume: f32,
    /// Audio preceding the speech onset, in frames of `data.len()` bytes;
    /// non-empty only on the frame where speech starts.
    pub vad_cache: Vec<u8>,
}

/// A multi-channel audio front end.
pub trait AfeEngine: Send {
    /// Samples per channel consumed by one [`feed`](Self::feed).
    fn feed_chunk_size(&self) -> usize;

    /// Interleaved channels expected by [`feed`](Self::feed).
    fn feed_channels(&self) -> usize;

    /// Stages enabled when the engine was built.
    fn initial_features(&self) -> Features;

    /// Consumes one chunk of interleaved samples
    /// (`feed_chunk_size() * feed_channels()` values).
    fn feed(&mut self, samples: &[i16]);

    /// Next processed frame, if one is ready.
    fn fetch(&mut self) -> Option<FetchResult>;

    /// Switches a stage on or off, returning whether it is now on.
    ///
    /// # Errors
    ///
    /// [`gmf_core::Error::NotSupport`] for a stage the engine lacks.
    fn set_feature(&mut self, feature: Feature, enable: bool) -> Result<bool>;

    /// Clears voice activity history.
    fn reset_vad(&mut self);
}

/// Read access to and switching of engine features.
///
/// Implemented by the [`AfeManager`](super::AfeManager); the wake state
/// machine only sees this seam.
pub trait FeatureControl: Send + Sync {
    /// Currently enabled features.
    fn features(&self) -> Features;

    /// Switches one feature.
    ///
    /// # Errors
    ///
    /// The engine's error for an unsupported feature.
    fn enable_feature(&self, feature: Feature, enable: bool) -> Result<()>;
}
