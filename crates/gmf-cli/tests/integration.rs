//! Integration tests for gmf-cli.
//!
//! Every test runs the real binary against files in a temporary directory.

use std::path::Path;
use std::process::{Command, Output};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

/// Helper to get the path to the `gmf` binary built by cargo.
fn gmf_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_gmf"))
}

fn gmf(args: &[&str]) -> Output {
    gmf_bin().args(args).output().expect("failed to run gmf")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
    let spec = WavSpec {
        channels,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

fn read_wav(path: &Path) -> (WavSpec, Vec<i16>) {
    let reader = WavReader::open(path).unwrap();
    let spec = reader.spec();
    let samples = reader.into_samples::<i16>().map(Result::unwrap).collect();
    (spec, samples)
}

// ---------------------------------------------------------------------------
// `gmf --help`
// ---------------------------------------------------------------------------

#[test]
fn help_lists_every_command() {
    let output = gmf(&["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for cmd in ["bus", "doa", "afe", "pipeline", "config"] {
        assert!(text.contains(cmd), "help should mention '{cmd}'");
    }
}

// ---------------------------------------------------------------------------
// `gmf bus`
// ---------------------------------------------------------------------------

#[test]
fn bus_delivers_stream_on_every_kind() {
    for kind in ["ringbuf", "block", "fifo", "pbuf"] {
        let output = gmf(&["bus", "--kind", kind, "--bytes", "50000", "--size", "4096", "--blocks", "4"]);
        assert!(output.status.success(), "bus {kind} failed: {}", String::from_utf8_lossy(&output.stderr));
        let text = stdout(&output);
        assert!(text.contains("Result:    ok"), "{kind}: {text}");
        assert!(text.contains("50000 bytes"), "{kind}: {text}");
    }
}

#[test]
fn bus_rejects_zero_sized_transfers() {
    let output = gmf(&["bus", "--write", "0"]);
    assert!(!output.status.success());
}

#[test]
fn bus_rejects_unknown_kind() {
    let output = gmf(&["bus", "--kind", "spool"]);
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `gmf config`
// ---------------------------------------------------------------------------

#[test]
fn config_init_show_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiles/room.toml");
    let path_str = path.to_str().unwrap();

    let output = gmf(&["config", "init", path_str, "--name", "room"]);
    assert!(output.status.success());
    assert!(path.exists());

    let output = gmf(&["config", "show", path_str]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("name = \"room\""));
    assert!(text.contains("[doa.tracker]"));

    let output = gmf(&["config", "check", path_str]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("ok"));

    // a second init must not clobber the file
    let output = gmf(&["config", "init", path_str]);
    assert!(!output.status.success());
    let output = gmf(&["config", "init", path_str, "--force"]);
    assert!(output.status.success());
}

#[test]
fn config_check_reports_each_problem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[doa]\nmic_distance = 0.0\n\n[pipeline]\nelements = [\"reverb\"]\n").unwrap();

    let output = gmf(&["config", "check", path.to_str().unwrap()]);
    assert!(!output.status.success());
    let text = stdout(&output);
    assert!(text.contains("doa.mic_distance"), "{text}");
    assert!(text.contains("reverb"), "{text}");
}

#[test]
fn invalid_profile_stops_a_command() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[bus]\nblocks = 0\n").unwrap();

    let output = gmf(&["bus", "--profile", path.to_str().unwrap()]);
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `gmf pipeline`
// ---------------------------------------------------------------------------

#[test]
fn pipeline_copy_chain_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let out = dir.path().join("out.wav");
    let samples: Vec<i16> = (0..12_000).map(|i| ((i * 37) % 20_000 - 10_000) as i16).collect();
    write_wav(&input, 2, &samples);

    let output = gmf(&[
        "pipeline",
        input.to_str().unwrap(),
        out.to_str().unwrap(),
        "--elements",
        "copy,framer,copy",
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let (spec, got) = read_wav(&out);
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(got, samples);
}

#[test]
fn pipeline_gain_attenuates() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let out = dir.path().join("out.wav");
    write_wav(&input, 1, &[1000; 4000]);

    let output = gmf(&[
        "pipeline",
        input.to_str().unwrap(),
        out.to_str().unwrap(),
        "--elements",
        "gain",
        "--gain-db",
        "-6",
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("-6.0 dB"));

    let (_, got) = read_wav(&out);
    assert_eq!(got.len(), 4000);
    assert!(got.iter().all(|&s| s == 501), "{:?}", &got[..8]);
}

#[test]
fn pipeline_rejects_unknown_element() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    write_wav(&input, 1, &[0; 100]);
    let output = gmf(&["pipeline", input.to_str().unwrap(), "out.wav", "--elements", "reverb"]);
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `gmf doa`
// ---------------------------------------------------------------------------

/// 4-channel capture whose right microphone lags the left by `delay`.
fn capture(frames: usize, delay: usize) -> Vec<i16> {
    let mut state = 12345u32;
    let voice: Vec<i16> = (0..frames + delay)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            ((state >> 16) as i16) / 4
        })
        .collect();
    (0..frames).flat_map(|n| [0, voice[n + delay], 0, voice[n]]).collect()
}

#[test]
fn doa_reports_one_angle_per_chunk_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.wav");
    write_wav(&input, 4, &capture(256 * 6, 2));

    let output = gmf(&["doa", input.to_str().unwrap(), "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["chunks"], 6);
    let estimates = report["estimates"].as_array().unwrap();
    assert_eq!(estimates.len(), 6);
    for est in estimates {
        let angle = est["angle_deg"].as_f64().unwrap();
        assert!(angle < 70.0, "{angle}");
    }
}

#[test]
fn doa_tracking_publishes_a_synced_angle() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.wav");
    // 1.6 s of capture, four tracker intervals
    write_wav(&input, 4, &capture(256 * 100, 2));

    let output = gmf(&["doa", input.to_str().unwrap(), "--track", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["tracked"], true);
    let estimates = report["estimates"].as_array().unwrap();
    assert!(!estimates.is_empty());
    assert!(estimates[0]["angle_deg"].as_f64().unwrap() < 70.0);
}

#[test]
fn doa_needs_four_channels() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("stereo.wav");
    write_wav(&input, 2, &[0; 2048]);
    let output = gmf(&["doa", input.to_str().unwrap()]);
    assert!(!output.status.success());
}

// ---------------------------------------------------------------------------
// `gmf afe`
// ---------------------------------------------------------------------------

#[test]
fn afe_finds_one_speech_segment() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("speech.wav");
    let processed = dir.path().join("processed.wav");
    let mut samples = vec![0i16; 512 * 10];
    samples.extend((0..512 * 20).map(|i| if i % 2 == 0 { 8000 } else { -8000 }));
    samples.extend(vec![0i16; 512 * 30]);
    write_wav(&input, 1, &samples);

    let output = gmf(&["afe", input.to_str().unwrap(), "--output", processed.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    let start = text.find("VAD_START").expect("no VAD_START");
    let end = text.find("VAD_END").expect("no VAD_END");
    assert!(start < end);
    assert!(text.contains("Speech segments: 1"));

    let (spec, got) = read_wav(&processed);
    assert_eq!(spec.channels, 1);
    assert!(got.len() <= samples.len());
}

#[test]
fn afe_rejects_float_wav() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("float.wav");
    let spec = WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(&input, spec).unwrap();
    for _ in 0..100 {
        writer.write_sample(0.0f32).unwrap();
    }
    writer.finalize().unwrap();

    let output = gmf(&["afe", input.to_str().unwrap()]);
    assert!(!output.status.success());
}
