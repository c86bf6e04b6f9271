//! Profile file format and conversions to runtime settings.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gmf_ai_audio::afe::{AfeConfig, EnergyVadConfig, Features, WakeTimeouts};
use gmf_ai_audio::doa::{DoaConfig, TrackerConfig};
use gmf_core::{DataBus, new_block, new_fifo, new_pbuf, new_ringbuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete runtime profile.
///
/// Every section and every field is optional in the file; missing values
/// take the runtime defaults.
///
/// # TOML Format
///
/// ```toml
/// name = "kitchen"
///
/// [bus]
/// kind = "ringbuf"
/// blocks = 1
/// size = 8192
///
/// [afe]
/// wakeup = true
/// vad = true
/// vad_threshold = 0.03
///
/// [doa]
/// mic_distance = 0.06
///
/// [doa.tracker]
/// update_interval_ms = 400
///
/// [pipeline]
/// elements = ["copy", "gain"]
/// gain_db = -6.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    /// Name of the profile.
    #[serde(default = "default_name")]
    pub name: String,

    /// Data bus used by the bus scenario.
    #[serde(default)]
    pub bus: BusSection,

    /// Audio front end.
    #[serde(default)]
    pub afe: AfeSection,

    /// Direction of arrival.
    #[serde(default)]
    pub doa: DoaSection,

    /// Element chain.
    #[serde(default)]
    pub pipeline: PipelineSection,
}

fn default_name() -> String {
    "default".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: default_name(),
            bus: BusSection::default(),
            afe: AfeSection::default(),
            doa: DoaSection::default(),
            pipeline: PipelineSection::default(),
        }
    }
}

impl Profile {
    /// Create a default profile with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load a profile from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load a profile from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the profile to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
            }
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the profile to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::validation::validate_profile(self)?;
        Ok(())
    }
}

// --- bus ---

/// Data bus flavour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// Contiguous block arena.
    Block,
    /// Byte ring.
    #[default]
    Ringbuf,
    /// Blocking queue of buffers.
    Fifo,
    /// Non-blocking pool of buffers.
    Pbuf,
}

impl BusType {
    /// Name as written in the profile.
    pub fn as_str(self) -> &'static str {
        match self {
            BusType::Block => "block",
            BusType::Ringbuf => "ringbuf",
            BusType::Fifo => "fifo",
            BusType::Pbuf => "pbuf",
        }
    }
}

impl std::str::FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(BusType::Block),
            "ringbuf" | "ring" => Ok(BusType::Ringbuf),
            "fifo" => Ok(BusType::Fifo),
            "pbuf" => Ok(BusType::Pbuf),
            other => Err(format!("unknown bus kind '{other}'")),
        }
    }
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusSection {
    /// Bus flavour.
    #[serde(default)]
    pub kind: BusType,
    /// Blocks (block, ringbuf) or buffers (fifo, pbuf).
    #[serde(default = "default_blocks")]
    pub blocks: usize,
    /// Bytes per block; unused by pbuf.
    #[serde(default = "default_bus_size")]
    pub size: usize,
}

fn default_blocks() -> usize {
    1
}

fn default_bus_size() -> usize {
    8192
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            kind: BusType::default(),
            blocks: default_blocks(),
            size: default_bus_size(),
        }
    }
}

impl BusSection {
    /// Creates the configured bus.
    pub fn build(&self) -> Result<Arc<dyn DataBus>, ConfigError> {
        let bus = match self.kind {
            BusType::Block => new_block(self.blocks, self.size),
            BusType::Ringbuf => new_ringbuf(self.blocks, self.size),
            BusType::Fifo => new_fifo(self.blocks, self.size),
            BusType::Pbuf => new_pbuf(self.blocks),
        };
        bus.map_err(|e| ConfigError::build("data bus", e))
    }
}

// --- afe ---

/// `[afe]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AfeSection {
    /// Samples per channel per feed.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Interleaved capture channels.
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Wake word detection.
    #[serde(default)]
    pub wakeup: bool,
    /// Voice activity detection.
    #[serde(default = "default_true")]
    pub vad: bool,
    /// RMS threshold for voice, in [0, 1].
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Quiet chunks tolerated inside speech.
    #[serde(default = "default_hangover")]
    pub hangover: usize,
    /// Chunks of audio kept ahead of speech onset.
    #[serde(default = "default_cache_chunks")]
    pub cache_chunks: usize,
    /// Samples held back before output.
    #[serde(default = "default_delay_samples")]
    pub delay_samples: usize,
    /// Wake window after a wake word, ms.
    #[serde(default = "default_wakeup_ms")]
    pub wakeup_time_ms: u64,
    /// Window after speech ends before sleeping, ms.
    #[serde(default = "default_wakeup_ms")]
    pub wakeup_end_ms: u64,
    /// Voice command detection.
    #[serde(default)]
    pub vcmd_detect: bool,
    /// Voice command timeout, ms; 0 uses the default.
    #[serde(default = "default_vcmd_timeout_ms")]
    pub vcmd_timeout_ms: u64,
    /// Command model language.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_chunk_size() -> usize {
    512
}

fn default_channels() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_vad_threshold() -> f32 {
    0.02
}

fn default_hangover() -> usize {
    8
}

fn default_cache_chunks() -> usize {
    4
}

fn default_delay_samples() -> usize {
    2048
}

fn default_wakeup_ms() -> u64 {
    30_000
}

fn default_vcmd_timeout_ms() -> u64 {
    5760
}

fn default_language() -> String {
    "cn".to_string()
}

impl Default for AfeSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            channels: default_channels(),
            wakeup: false,
            vad: default_true(),
            vad_threshold: default_vad_threshold(),
            hangover: default_hangover(),
            cache_chunks: default_cache_chunks(),
            delay_samples: default_delay_samples(),
            wakeup_time_ms: default_wakeup_ms(),
            wakeup_end_ms: default_wakeup_ms(),
            vcmd_detect: false,
            vcmd_timeout_ms: default_vcmd_timeout_ms(),
            language: default_language(),
        }
    }
}

impl AfeSection {
    /// Features switched on at start.
    pub fn features(&self) -> Features {
        Features {
            wakeup: self.wakeup,
            vad: self.vad,
            ..Features::default()
        }
    }

    /// Settings for the energy engine.
    pub fn engine_config(&self) -> EnergyVadConfig {
        EnergyVadConfig {
            chunk_size: self.chunk_size,
            channels: self.channels,
            threshold: self.vad_threshold,
            hangover: self.hangover,
            cache_chunks: self.cache_chunks,
            features: self.features(),
        }
    }

    /// Settings for the AFE element.
    pub fn element_config(&self) -> AfeConfig {
        AfeConfig {
            delay_samples: self.delay_samples,
            timeouts: WakeTimeouts {
                wakeup_time: Duration::from_millis(self.wakeup_time_ms),
                wakeup_end: Duration::from_millis(self.wakeup_end_ms),
            },
            vcmd_detect: self.vcmd_detect,
            vcmd_timeout: Duration::from_millis(self.vcmd_timeout_ms),
            language: self.language.clone(),
            ..AfeConfig::default()
        }
    }
}

// --- doa ---

/// `[doa]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoaSection {
    /// Capture sample rate, Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Angle grid step, degrees.
    #[serde(default = "default_resolution")]
    pub resolution_deg: f32,
    /// Microphone spacing, metres.
    #[serde(default = "default_mic_distance")]
    pub mic_distance: f32,
    /// Bytes of 4-channel capture per estimate.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Ring capacity in chunks.
    #[serde(default = "default_ring_chunks")]
    pub ring_chunks: usize,
    /// `[doa.tracker]` subsection.
    #[serde(default)]
    pub tracker: TrackerSection,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_resolution() -> f32 {
    10.0
}

fn default_mic_distance() -> f32 {
    0.06
}

fn default_chunk_bytes() -> usize {
    2048
}

fn default_ring_chunks() -> usize {
    3
}

impl Default for DoaSection {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            resolution_deg: default_resolution(),
            mic_distance: default_mic_distance(),
            chunk_bytes: default_chunk_bytes(),
            ring_chunks: default_ring_chunks(),
            tracker: TrackerSection::default(),
        }
    }
}

impl From<&DoaSection> for DoaConfig {
    fn from(s: &DoaSection) -> Self {
        DoaConfig {
            sample_rate: s.sample_rate,
            resolution_deg: s.resolution_deg,
            mic_distance: s.mic_distance,
            chunk_bytes: s.chunk_bytes,
            ring_chunks: s.ring_chunks,
        }
    }
}

/// `[doa.tracker]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerSection {
    /// Filter weight for small moves, in (0, 1].
    #[serde(default = "default_slow_alpha")]
    pub slow_alpha: f32,
    /// Filter weight for supported large moves, in (0, 1].
    #[serde(default = "default_fast_alpha")]
    pub fast_alpha: f32,
    /// Large move threshold, degrees.
    #[serde(default = "default_large_diff")]
    pub large_diff_deg: f32,
    /// Publish period, ms.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_slow_alpha() -> f32 {
    0.15
}

fn default_fast_alpha() -> f32 {
    0.6
}

fn default_large_diff() -> f32 {
    12.0
}

fn default_update_interval_ms() -> u64 {
    400
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            slow_alpha: default_slow_alpha(),
            fast_alpha: default_fast_alpha(),
            large_diff_deg: default_large_diff(),
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

impl From<&TrackerSection> for TrackerConfig {
    fn from(s: &TrackerSection) -> Self {
        TrackerConfig {
            slow_alpha: s.slow_alpha,
            fast_alpha: s.fast_alpha,
            large_diff_deg: s.large_diff_deg,
            update_interval: Duration::from_millis(s.update_interval_ms),
        }
    }
}

// --- pipeline ---

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Element tags in order.
    #[serde(default = "default_elements")]
    pub elements: Vec<String>,
    /// Gain applied by a `gain` element, dB.
    #[serde(default)]
    pub gain_db: f32,
}

fn default_elements() -> Vec<String> {
    vec!["copy".to_string()]
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            elements: default_elements(),
            gain_db: 0.0,
        }
    }
}
