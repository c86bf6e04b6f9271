//! Voice front end and direction finding on top of `gmf-core` pipelines.
//!
//! # Modules
//!
//! - [`afe`] - wake word and voice activity state, voice commands, the AFE
//!   manager threads and the AFE pipeline element
//! - [`doa`] - direction of arrival estimation, tracking and its element
//! - [`wn`] - standalone wake word element with a trigger channel callback
//! - [`aec`] - echo cancellation element
//! - [`timer`] - software timers used by the AFE and DOA
//!
//! # Example
//!
//! ```no_run
//! use gmf_ai_audio::doa::{AudioDoa, DoaConfig};
//!
//! let doa = AudioDoa::new(DoaConfig::default())?;
//! doa.set_result_callback(Some(Box::new(|angle| println!("{angle:.1}°"))));
//! doa.start()?;
//! doa.data_write(&[0u8; 2048])?;
//! # Ok::<(), gmf_core::Error>(())
//! ```

pub mod aec;
pub mod afe;
pub mod doa;
mod frame;
pub mod timer;
pub mod wn;

#[cfg(test)]
mod test_util;

pub use aec::{AecElement, AecEngine, NlmsAec};
pub use afe::{AfeConfig, AfeElement, AfeEvent, AfeHandle, AfeManager, EnergyVadEngine};
pub use doa::{AudioDoa, DoaConfig, DoaElement, DoaTracker, TrackerConfig};
pub use frame::{AI_BITS, AI_SAMPLE_RATE, ChannelFormat};
pub use timer::SoftTimer;
pub use wn::{DetectCb, EnergyWakeConfig, EnergyWakeEngine, WakeNetEngine, WnElement};
