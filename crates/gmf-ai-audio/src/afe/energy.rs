//! Energy-based reference engine.
//!
//! Voice activity is an RMS threshold on the first channel with a hangover
//! so short pauses inside a word do not end speech. The engine has no
//! wake-word model: the `WakeNet` feature can be switched but never fires,
//! so wake-ups come from [`AfeHandle::trigger_wakeup`](super::AfeHandle::trigger_wakeup).

use std::collections::VecDeque;

use gmf_core::{Error, Result};

use super::engine::{AfeEngine, Feature, FetchResult, Features, VadState};

/// Tuning for [`EnergyVadEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyVadConfig {
    /// Samples per channel per feed.
    pub chunk_size: usize,
    /// Interleaved input channels; the first carries the voice.
    pub channels: usize,
    /// RMS threshold on samples normalised to [-1, 1]; speech is strictly above.
    pub threshold: f32,
    /// Quiet chunks tolerated before speech ends.
    pub hangover: usize,
    /// Chunks of pre-speech audio handed out at speech onset.
    pub cache_chunks: usize,
    /// Features enabled at creation.
    pub features: Features,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            channels: 1,
            threshold: 0.02,
            hangover: 8,
            cache_chunks: 4,
            features: Features {
                vad: true,
                ..Features::default()
            },
        }
    }
}

/// RMS voice activity detector behind the [`AfeEngine`] seam.
#[derive(Debug)]
pub struct EnergyVadEngine {
    initial: Features,
    chunk_size: usize,
    channels: usize,
    threshold: f32,
    hangover: usize,
    cache_chunks: usize,
    features: Features,
    speaking: bool,
    quiet_run: usize,
    history: VecDeque<Vec<u8>>,
    ready: VecDeque<FetchResult>,
}

impl EnergyVadEngine {
    /// Builds an engine.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] for a zero chunk size or channel count, or a
    /// negative threshold.
    pub fn new(config: &EnergyVadConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.channels == 0 {
            return Err(Error::invalid_arg("chunk size and channel count must be non-zero"));
        }
        if config.threshold.is_nan() || config.threshold < 0.0 {
            return Err(Error::invalid_arg(format!("threshold {}", config.threshold)));
        }
        Ok(Self {
            initial: config.features,
            chunk_size: config.chunk_size,
            channels: config.channels,
            threshold: config.threshold,
            hangover: config.hangover,
            cache_chunks: config.cache_chunks,
            features: config.features,
            speaking: false,
            quiet_run: 0,
            history: VecDeque::with_capacity(config.cache_chunks + 1),
            ready: VecDeque::new(),
        })
    }

    fn classify(&mut self, loud: bool) -> VadState {
        if loud {
            self.speaking = true;
            self.quiet_run = 0;
        } else if self.speaking {
            self.quiet_run += 1;
            if self.quiet_run > self.hangover {
                self.speaking = false;
                self.quiet_run = 0;
            }
        }
        if self.speaking { VadState::Speech } else { VadState::Silence }
    }
}

/// Root mean square of 16-bit samples, normalised to full scale.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let value = (libm::sqrt(sum / samples.len() as f64) / 32768.0) as f32;
    value
}

/// Level in dBFS, floored at -100.
pub fn volume_db(rms: f32) -> f32 {
    if rms <= 1e-5 {
        -100.0
    } else {
        20.0 * libm::log10f(rms)
    }
}

impl AfeEngine for EnergyVadEngine {
    fn feed_chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn feed_channels(&self) -> usize {
        self.channels
    }

    fn initial_features(&self) -> Features {
        self.initial
    }

    fn feed(&mut self, samples: &[i16]) {
        let voice: Vec<i16> = samples.iter().step_by(self.channels).copied().take(self.chunk_size).collect();
        let level = rms(&voice);
        let data: Vec<u8> = voice.iter().flat_map(|s| s.to_le_bytes()).collect();

        let was_speaking = self.speaking;
        let vad_state = if self.features.vad {
            self.classify(level > self.threshold)
        } else {
            VadState::Silence
        };
        let vad_cache = if vad_state == VadState::Speech && !was_speaking {
            self.history.iter().flatten().copied().collect()
        } else {
            Vec::new()
        };

        if self.cache_chunks > 0 {
            if self.history.len() == self.cache_chunks {
                self.history.pop_front();
            }
            self.history.push_back(data.clone());
        }
        self.ready.push_back(FetchResult {
            data,
            vad_state,
            wakeup: None,
            data_volume: volume_db(level),
            vad_cache,
        });
    }

    fn fetch(&mut self) -> Option<FetchResult> {
        self.ready.pop_front()
    }

    fn set_feature(&mut self, feature: Feature, enable: bool) -> Result<bool> {
        match feature {
            Feature::Vad | Feature::WakeNet => {
                self.features.set(feature, enable);
                Ok(enable)
            }
            Feature::Aec | Feature::Se => Err(Error::not_support(format!("{feature:?} in energy engine"))),
        }
    }

    fn reset_vad(&mut self) {
        self.speaking = false;
        self.quiet_run = 0;
        self.history.clear();
    }
}
