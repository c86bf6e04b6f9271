//! Direction of arrival over a recorded 4-channel capture.
//!
//! Every chunk yields one smoothed, calibrated angle. With `--track` the
//! angles go through the voice-gated tracker instead, ticked on the
//! recording's own clock, and only its published updates are printed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Args;
use gmf_ai_audio::afe::rms;
use gmf_ai_audio::doa::{CAPTURE_CHANNELS, DoaConfig, DoaProcessor, DoaTracker, MIC_OFFSETS, TrackerConfig};
use serde::Serialize;

use crate::{profile, wav};

/// Estimate the talker direction in a 4-channel 16-bit WAV file.
#[derive(Args)]
pub struct DoaArgs {
    /// 4-channel 16-bit capture
    pub input: PathBuf,

    /// Profile to take the [doa] section from
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Print tracker updates instead of every estimate
    #[arg(long)]
    pub track: bool,

    /// Output JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Estimate {
    time_s: f64,
    angle_deg: f32,
}

#[derive(Serialize)]
struct Report {
    file: String,
    sample_rate: u32,
    chunks: usize,
    tracked: bool,
    estimates: Vec<Estimate>,
}

/// Run the doa command.
pub fn run(args: DoaArgs) -> anyhow::Result<()> {
    let profile = profile::load(args.profile.as_deref())?;
    let pcm = wav::read_pcm16(&args.input)?;
    if usize::from(pcm.spec.channels) != CAPTURE_CHANNELS {
        bail!(
            "{}: direction finding needs {} channels, found {}",
            args.input.display(),
            CAPTURE_CHANNELS,
            pcm.spec.channels
        );
    }

    let mut config = DoaConfig::from(&profile.doa);
    config.sample_rate = pcm.spec.sample_rate;
    let mut processor = DoaProcessor::new(&config)?;
    let chunk_secs = config.frame_size() as f64 / f64::from(config.sample_rate);

    let mut tracking = args.track.then(|| {
        TrackerClock::new(TrackerConfig::from(&profile.doa.tracker), profile.afe.vad_threshold, chunk_secs)
    });

    let mut estimates = Vec::new();
    let mut chunks = 0;
    for (i, chunk) in pcm.bytes.chunks_exact(config.chunk_bytes).enumerate() {
        chunks += 1;
        let angle = processor.process_chunk(chunk);
        let time_s = (i + 1) as f64 * chunk_secs;
        match tracking.as_mut() {
            Some(clock) => {
                if let Some(angle_deg) = clock.step(chunk, angle) {
                    estimates.push(Estimate { time_s, angle_deg });
                }
            }
            None => estimates.push(Estimate { time_s, angle_deg: angle }),
        }
    }
    tracing::debug!(chunks, estimates = estimates.len(), "doa done");

    let report = Report {
        file: args.input.display().to_string(),
        sample_rate: config.sample_rate,
        chunks,
        tracked: args.track,
        estimates,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File:        {}", report.file);
    println!("Duration:    {:.3}s ({} chunks of {} frames)", pcm.duration_secs(), chunks, config.frame_size());
    println!("Mode:        {}", if args.track { "tracked" } else { "per chunk" });
    println!();
    println!("{:>10}  {:>8}", "time (s)", "angle");
    for est in &report.estimates {
        println!("{:>10.3}  {:>7.1}°", est.time_s, est.angle_deg);
    }
    Ok(())
}

/// Drives a [`DoaTracker`] from chunk timestamps rather than its timer.
struct TrackerClock {
    tracker: std::sync::Arc<DoaTracker>,
    threshold: f32,
    chunk: Duration,
    interval: Duration,
    elapsed: Duration,
    voice: Vec<i16>,
}

impl TrackerClock {
    fn new(config: TrackerConfig, threshold: f32, chunk_secs: f64) -> Self {
        Self {
            interval: config.update_interval,
            tracker: DoaTracker::new(config, Box::new(|_| {})),
            threshold,
            chunk: Duration::from_secs_f64(chunk_secs),
            elapsed: Duration::ZERO,
            voice: Vec::new(),
        }
    }

    /// Feeds one chunk and its angle; returns a published update.
    fn step(&mut self, chunk: &[u8], angle: f32) -> Option<f32> {
        self.voice.clear();
        self.voice.extend(
            chunk
                .chunks_exact(2 * CAPTURE_CHANNELS)
                .map(|frame| i16::from_le_bytes([frame[2 * MIC_OFFSETS.0], frame[2 * MIC_OFFSETS.0 + 1]])),
        );
        self.tracker.set_vad_state(rms(&self.voice) > self.threshold);
        self.tracker.feed(angle);

        self.elapsed += self.chunk;
        if self.elapsed < self.interval {
            return None;
        }
        self.elapsed -= self.interval;
        self.tracker.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_chunk() -> Vec<u8> {
        (0..256)
            .flat_map(|i| {
                let s: i16 = if i % 2 == 0 { 8000 } else { -8000 };
                [0, s, 0, s].into_iter().flat_map(i16::to_le_bytes)
            })
            .collect()
    }

    #[test]
    fn tracker_ticks_on_the_recording_clock() {
        // 16 ms chunks against a 400 ms interval
        let mut clock = TrackerClock::new(TrackerConfig::default(), 0.02, 0.016);
        let chunk = loud_chunk();
        let published: Vec<_> = (0..50).filter_map(|_| clock.step(&chunk, 75.0)).collect();
        assert_eq!(published, vec![75.0]);
    }

    #[test]
    fn quiet_capture_never_publishes() {
        let mut clock = TrackerClock::new(TrackerConfig::default(), 0.02, 0.016);
        let chunk = vec![0u8; 2048];
        assert!((0..100).all(|_| clock.step(&chunk, 40.0).is_none()));
    }
}
