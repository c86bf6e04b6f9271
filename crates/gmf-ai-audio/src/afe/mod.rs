//! Audio front end: wake word, voice activity and voice command handling.
//!
//! - [`AfeEngine`] - the processing seam; [`EnergyVadEngine`] implements it
//! - [`AfeManager`] - feed and fetch threads around an engine
//! - [`WakeMachine`] - wake / speech lifecycle driven by fetched frames
//! - [`VcmdDetector`] - armable voice command recognition
//! - [`AfeElement`] - all of the above as a pipeline element

mod element;
mod energy;
mod engine;
mod event;
mod manager;
mod state;
mod vcmd;

pub use element::{ARG_VCMD_DET_EN, AfeConfig, AfeElement, AfeHandle, METHOD_START_VCMD_DET};
pub use energy::{EnergyVadConfig, EnergyVadEngine, rms, volume_db};
pub use engine::{AfeEngine, Feature, FeatureControl, FetchResult, Features, VadState, WakeupInfo};
pub use event::{AfeEvent, EventSink, VCMD_MAX_LEN, VcmdInfo};
pub use manager::{AfeManager, FEED_READ_WAIT, ReadCb, ResultCb};
pub use state::{WakeEvent, WakeMachine, WakeState, WakeTimeouts};
pub use vcmd::{
    CommandRecognizer, DEFAULT_VCMD_TIMEOUT, MnState, RecognizerFactory, SilentRecognizer, VcmdDetector,
    effective_timeout,
};
