//! TOML profiles for gmf pipelines.
//!
//! A [`Profile`] gathers the settings of the data bus, the audio front end,
//! direction of arrival and the element chain. Sections convert into the
//! runtime configuration types of `gmf-core` and `gmf-ai-audio`.
//!
//! # Example
//!
//! ```rust,no_run
//! use gmf_config::Profile;
//! use gmf_ai_audio::doa::DoaConfig;
//!
//! let profile = Profile::load("gmf.toml")?;
//! profile.validate()?;
//! let doa = DoaConfig::from(&profile.doa);
//! let bus = profile.bus.build()?;
//! # Ok::<(), gmf_config::ConfigError>(())
//! ```

mod error;
mod profile;

/// Profile validation.
pub mod validation;

pub use error::ConfigError;
pub use profile::{AfeSection, BusSection, BusType, DoaSection, PipelineSection, Profile, TrackerSection};
pub use validation::{
    KNOWN_ELEMENTS, ValidationError, ValidationResult, validate_afe, validate_bus, validate_doa, validate_pipeline,
    validate_profile,
};
