//! Run the energy-VAD audio front end over a recording.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use gmf_ai_audio::afe::{AfeElement, AfeEvent, AfeManager, EnergyVadEngine};
use gmf_core::Pipeline;
use hound::WavSpec;

use crate::stream::{Rings, run_through};
use crate::{profile, wav};

/// Events can trail the pipeline's end by one fetch cycle.
const EVENT_GRACE: Duration = Duration::from_millis(200);

/// Detect speech in a 16-bit WAV file and print the front end's events.
#[derive(Args)]
pub struct AfeArgs {
    /// 16-bit capture; the first channel carries the voice
    pub input: PathBuf,

    /// Profile to take the [afe] section from
    #[arg(long)]
    pub profile: Option<PathBuf>,

    /// Speech threshold as normalised RMS, overriding the profile
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Write the processed mono stream here
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Run the afe command.
pub fn run(args: AfeArgs) -> anyhow::Result<()> {
    let mut section = profile::load(args.profile.as_deref())?.afe;
    if let Some(threshold) = args.threshold {
        section.vad_threshold = threshold;
    }
    let pcm = wav::read_pcm16(&args.input)?;
    section.channels = usize::from(pcm.spec.channels);
    gmf_config::validate_afe(&section)?;

    let engine = EnergyVadEngine::new(&section.engine_config())?;
    let manager = Arc::new(AfeManager::new(Box::new(engine), None)?);
    let afe = AfeElement::new(Arc::clone(&manager), section.element_config());
    let events = afe.handle().event_channel();

    let rings = Rings::new()?;
    let mut pipeline = Pipeline::new(
        "afe",
        vec![afe.into_element("ai_afe")],
        Some(rings.reader()),
        Some(rings.writer()),
    )?;
    let output = run_through(&mut pipeline, &rings, &pcm.bytes)?;

    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(EVENT_GRACE) {
        seen.push(event);
    }

    println!("File:        {}", args.input.display());
    println!("Duration:    {:.3}s", pcm.duration_secs());
    println!("Threshold:   {}", section.vad_threshold);
    println!();
    for event in &seen {
        match event {
            AfeEvent::WakeupStart(info) => {
                println!("{:<18} {:>5}  word {}", event.name(), event.id(), info.wake_word_index);
            }
            _ => println!("{:<18} {:>5}", event.name(), event.id()),
        }
    }
    let speech = seen.iter().filter(|e| matches!(e, AfeEvent::VadStart)).count();
    println!();
    println!("Speech segments: {speech}");

    if let Some(path) = args.output {
        let spec = WavSpec {
            channels: 1,
            ..pcm.spec
        };
        wav::write_pcm16(&path, spec, &output)?;
        println!("Processed:   {} ({} bytes)", path.display(), output.len());
    }
    Ok(())
}
