//! Integration tests for gmf-config: files on disk and runtime conversions.

use gmf_ai_audio::doa::{AudioDoa, DoaConfig, TrackerConfig};
use gmf_config::{BusType, ConfigError, Profile, ValidationError};
use gmf_core::Wait;
use tempfile::TempDir;

#[test]
fn save_and_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profiles").join("desk.toml");

    let mut profile = Profile::new("desk");
    profile.bus.kind = BusType::Block;
    profile.afe.wakeup = true;
    profile.doa.tracker.update_interval_ms = 200;
    profile.pipeline.elements = vec!["copy".into(), "gain".into()];
    profile.pipeline.gain_db = -3.0;
    profile.save(&path).unwrap();

    let loaded = Profile::load(&path).unwrap();
    assert_eq!(loaded, profile);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = Profile::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { ref path, .. } if path.ends_with("absent.toml")));
}

#[test]
fn invalid_profile_fails_validation() {
    let profile = Profile::from_toml("[doa]\nmic_distance = 0.0\n").unwrap();
    let err = profile.validate().unwrap_err();
    assert!(matches!(err, ConfigError::Validation(ValidationError::OutOfRange { .. })));
}

#[test]
fn configured_bus_carries_bytes() {
    let profile = Profile::from_toml("[bus]\nkind = \"ringbuf\"\nsize = 256\n").unwrap();
    let bus = profile.bus.build().unwrap();
    bus.write(b"profile", true, Wait::Immediate).unwrap();
    let mut buf = [0u8; 16];
    let (n, last) = bus.read(&mut buf, Wait::Immediate).unwrap();
    assert_eq!(&buf[..n], b"profile");
    assert!(last);
}

#[test]
fn doa_section_builds_an_estimator() {
    let profile = Profile::from_toml("[doa]\nresolution_deg = 5.0\n\n[doa.tracker]\nfast_alpha = 0.5\n").unwrap();
    let config = DoaConfig::from(&profile.doa);
    assert_eq!(config.resolution_deg, 5.0);
    assert!(AudioDoa::new(config).is_ok());
    assert_eq!(TrackerConfig::from(&profile.doa.tracker).fast_alpha, 0.5);
}
