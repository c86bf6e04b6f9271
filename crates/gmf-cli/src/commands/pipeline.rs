//! Process a WAV file through a chain of stock elements.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use gmf_core::{ArgValue, Pipeline, Pool};

use crate::stream::{Rings, run_through};
use crate::{profile, wav};

/// Process a 16-bit WAV file through pipeline elements.
#[derive(Args)]
pub struct PipelineArgs {
    /// Input WAV file
    pub input: PathBuf,

    /// Output WAV file
    pub output: PathBuf,

    /// Comma-separated element chain (copy, gain, framer)
    #[arg(short, long, value_delimiter = ',')]
    pub elements: Option<Vec<String>>,

    /// Gain for `gain` elements in dB
    #[arg(short, long, allow_hyphen_values = true)]
    pub gain_db: Option<f32>,

    /// Profile to take the [pipeline] section from
    #[arg(long)]
    pub profile: Option<PathBuf>,
}

/// Run the pipeline command.
pub fn run(args: PipelineArgs) -> anyhow::Result<()> {
    let mut section = profile::load(args.profile.as_deref())?.pipeline;
    if let Some(elements) = args.elements {
        section.elements = elements.into_iter().map(|e| e.trim().to_ascii_lowercase()).collect();
    }
    if let Some(db) = args.gain_db {
        section.gain_db = db;
    }
    gmf_config::validate_pipeline(&section)?;

    let pool = Pool::with_builtin();
    let pcm = wav::read_pcm16(&args.input)?;
    let rings = Rings::new()?;
    let mut chain = Vec::with_capacity(section.elements.len());
    for kind in &section.elements {
        let mut el = pool.new_element(kind)?;
        if kind == "gain" && section.gain_db != 0.0 {
            let mut gain_args = el
                .methods()
                .into_iter()
                .find(|m| m.name == "set_gain")
                .map(|m| m.args())
                .context("gain element has no set_gain method")?;
            gain_args.set("db", ArgValue::F32(section.gain_db))?;
            el.exec_method("set_gain", &gain_args)?;
        }
        chain.push(el);
    }
    let mut pipeline = Pipeline::new(section.elements.join("+"), chain, Some(rings.reader()), Some(rings.writer()))?;

    let output = run_through(&mut pipeline, &rings, &pcm.bytes)?;
    wav::write_pcm16(&args.output, pcm.spec, &output)?;

    println!("Input:       {} ({:.3}s)", args.input.display(), pcm.duration_secs());
    println!("Chain:       {}", pipeline.element_tags().join(" -> "));
    if section.elements.iter().any(|e| e == "gain") {
        println!("Gain:        {:+.1} dB", section.gain_db);
    }
    println!("Output:      {} ({} bytes)", args.output.display(), output.len());
    Ok(())
}

