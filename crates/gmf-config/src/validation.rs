//! Profile validation.
//!
//! Each section is checked independently and every problem is reported,
//! so a broken profile can be fixed in one pass.
//!
//! # Example
//!
//! ```rust
//! use gmf_config::{Profile, validate_profile};
//!
//! let mut profile = Profile::default();
//! assert!(validate_profile(&profile).is_ok());
//!
//! profile.doa.mic_distance = 0.0;
//! assert!(validate_profile(&profile).is_err());
//! ```

use thiserror::Error;

use crate::profile::{AfeSection, BusSection, BusType, DoaSection, PipelineSection, Profile, TrackerSection};

/// Element tags a profile pipeline may name.
pub const KNOWN_ELEMENTS: &[&str] = &["copy", "gain", "framer"];

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Numeric field outside its accepted range.
    #[error("'{field}' value {value} out of range [{min}, {max}]")]
    OutOfRange {
        /// Dotted path of the field.
        field: String,
        /// The value that was out of range.
        value: f64,
        /// Minimum allowed value.
        min: f64,
        /// Maximum allowed value.
        max: f64,
    },

    /// Field that breaks a rule other than a range.
    #[error("invalid '{field}': {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: String,
        /// Description of the problem.
        reason: String,
    },

    /// Pipeline names an element nobody provides.
    #[error("unknown element: {0}")]
    UnknownElement(String),

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

#[derive(Default)]
struct Errors(Vec<ValidationError>);

impl Errors {
    fn range(&mut self, field: &str, value: f64, min: f64, max: f64) {
        if value.is_nan() || value < min || value > max {
            self.0.push(ValidationError::OutOfRange {
                field: field.to_string(),
                value,
                min,
                max,
            });
        }
    }

    fn check(&mut self, ok: bool, field: &str, reason: impl Into<String>) {
        if !ok {
            self.0.push(ValidationError::Invalid {
                field: field.to_string(),
                reason: reason.into(),
            });
        }
    }

    fn finish(mut self) -> ValidationResult<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(ValidationError::Multiple(self.0)),
        }
    }
}

/// Validate a whole profile.
pub fn validate_profile(profile: &Profile) -> ValidationResult<()> {
    let mut errors = Errors::default();
    bus(&profile.bus, &mut errors);
    afe(&profile.afe, &mut errors);
    doa(&profile.doa, &mut errors);
    pipeline(&profile.pipeline, &mut errors);
    errors.finish()
}

/// Validate the `[bus]` section.
pub fn validate_bus(section: &BusSection) -> ValidationResult<()> {
    let mut errors = Errors::default();
    bus(section, &mut errors);
    errors.finish()
}

/// Validate the `[afe]` section.
pub fn validate_afe(section: &AfeSection) -> ValidationResult<()> {
    let mut errors = Errors::default();
    afe(section, &mut errors);
    errors.finish()
}

/// Validate the `[doa]` section, tracker included.
pub fn validate_doa(section: &DoaSection) -> ValidationResult<()> {
    let mut errors = Errors::default();
    doa(section, &mut errors);
    errors.finish()
}

/// Validate the `[pipeline]` section.
pub fn validate_pipeline(section: &PipelineSection) -> ValidationResult<()> {
    let mut errors = Errors::default();
    pipeline(section, &mut errors);
    errors.finish()
}

fn bus(s: &BusSection, errors: &mut Errors) {
    errors.range("bus.blocks", s.blocks as f64, 1.0, 1024.0);
    if s.kind != BusType::Pbuf {
        errors.range("bus.size", s.size as f64, 1.0, f64::from(1u32 << 26));
    }
}

fn afe(s: &AfeSection, errors: &mut Errors) {
    errors.range("afe.chunk_size", s.chunk_size as f64, 1.0, 16384.0);
    errors.range("afe.channels", s.channels as f64, 1.0, 8.0);
    errors.range("afe.vad_threshold", f64::from(s.vad_threshold), 0.0, 1.0);
    errors.range("afe.hangover", s.hangover as f64, 0.0, 1000.0);
    errors.range("afe.cache_chunks", s.cache_chunks as f64, 0.0, 64.0);
    errors.range("afe.delay_samples", s.delay_samples as f64, 0.0, 1_048_576.0);
    errors.check(s.wakeup_time_ms > 0, "afe.wakeup_time_ms", "must be non-zero");
    errors.check(s.wakeup_end_ms > 0, "afe.wakeup_end_ms", "must be non-zero");
    errors.check(!s.language.trim().is_empty(), "afe.language", "must not be empty");
}

fn doa(s: &DoaSection, errors: &mut Errors) {
    errors.range("doa.sample_rate", f64::from(s.sample_rate), 8000.0, 192_000.0);
    errors.range("doa.resolution_deg", f64::from(s.resolution_deg), 0.1, 90.0);
    errors.range("doa.mic_distance", f64::from(s.mic_distance), 0.001, 1.0);
    errors.range("doa.ring_chunks", s.ring_chunks as f64, 1.0, 64.0);
    // four interleaved 16-bit channels per frame
    errors.check(
        s.chunk_bytes >= 8 && s.chunk_bytes % 8 == 0,
        "doa.chunk_bytes",
        format!("{} is not a whole number of 4-channel 16-bit frames", s.chunk_bytes),
    );
    tracker(&s.tracker, errors);
}

fn tracker(s: &TrackerSection, errors: &mut Errors) {
    errors.range("doa.tracker.slow_alpha", f64::from(s.slow_alpha), 0.0, 1.0);
    errors.range("doa.tracker.fast_alpha", f64::from(s.fast_alpha), 0.0, 1.0);
    errors.range("doa.tracker.large_diff_deg", f64::from(s.large_diff_deg), 0.0, 180.0);
    errors.check(s.update_interval_ms > 0, "doa.tracker.update_interval_ms", "must be non-zero");
}

fn pipeline(s: &PipelineSection, errors: &mut Errors) {
    errors.check(!s.elements.is_empty(), "pipeline.elements", "needs at least one element");
    for tag in &s.elements {
        if !KNOWN_ELEMENTS.iter().any(|k| k.eq_ignore_ascii_case(tag)) {
            errors.0.push(ValidationError::UnknownElement(tag.clone()));
        }
    }
    errors.range("pipeline.gain_db", f64::from(s.gain_db), -96.0, 24.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_valid() {
        assert!(validate_profile(&Profile::default()).is_ok());
    }

    #[test]
    fn single_problem_is_reported_alone() {
        let section = DoaSection {
            chunk_bytes: 1001,
            ..DoaSection::default()
        };
        assert!(matches!(
            validate_doa(&section),
            Err(ValidationError::Invalid { ref field, .. }) if field == "doa.chunk_bytes"
        ));
    }

    #[test]
    fn problems_across_sections_are_collected() {
        let mut profile = Profile::default();
        profile.bus.blocks = 0;
        profile.afe.vad_threshold = 2.0;
        profile.doa.tracker.update_interval_ms = 0;
        profile.pipeline.elements = vec!["copy".into(), "reverb".into()];
        let Err(ValidationError::Multiple(errors)) = validate_profile(&profile) else {
            panic!("expected several errors");
        };
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::UnknownElement("reverb".into())));
    }

    #[test]
    fn nan_is_out_of_range() {
        let section = TrackerSection {
            slow_alpha: f32::NAN,
            ..TrackerSection::default()
        };
        let mut errors = Errors::default();
        tracker(&section, &mut errors);
        assert_eq!(errors.0.len(), 1);
    }

    #[test]
    fn pbuf_ignores_block_size() {
        let section = BusSection {
            kind: BusType::Pbuf,
            blocks: 4,
            size: 0,
        };
        assert!(validate_bus(&section).is_ok());
    }

    #[test]
    fn element_tags_are_case_insensitive() {
        let section = PipelineSection {
            elements: vec!["Copy".into(), "GAIN".into()],
            gain_db: -6.0,
        };
        assert!(validate_pipeline(&section).is_ok());
    }

    #[test]
    fn empty_language_is_invalid() {
        let section = AfeSection {
            language: " ".into(),
            ..AfeSection::default()
        };
        assert!(validate_afe(&section).is_err());
    }

    #[test]
    fn multiple_display_joins_messages() {
        let err = ValidationError::Multiple(vec![
            ValidationError::UnknownElement("a".into()),
            ValidationError::UnknownElement("b".into()),
        ]);
        assert_eq!(err.to_string(), "multiple validation errors: unknown element: a; unknown element: b");
    }
}
