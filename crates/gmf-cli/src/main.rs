//! gmf CLI - Command-line front end for the gmf media pipeline.

mod commands;
mod profile;
mod stream;
mod wav;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gmf")]
#[command(author, version, about = "gmf media pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a byte stream through a data bus and verify it
    Bus(commands::bus::BusArgs),

    /// Estimate direction of arrival from a 4-channel capture
    Doa(commands::doa::DoaArgs),

    /// Run the audio front end over a recording and print its events
    Afe(commands::afe::AfeArgs),

    /// Process a WAV file through a chain of pipeline elements
    Pipeline(commands::pipeline::PipelineArgs),

    /// Create, show and check profiles
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays machine readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bus(args) => commands::bus::run(args),
        Commands::Doa(args) => commands::doa::run(args),
        Commands::Afe(args) => commands::afe::run(args),
        Commands::Pipeline(args) => commands::pipeline::run(args),
        Commands::Config(args) => commands::config::run(args),
    }
}
