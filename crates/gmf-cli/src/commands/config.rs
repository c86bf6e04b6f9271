//! Profile management commands.

use std::path::PathBuf;

use anyhow::bail;
use clap::{Args, Subcommand};
use gmf_config::{Profile, ValidationError};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a profile with every setting at its default
    Init {
        /// Where to write the profile
        path: PathBuf,

        /// Profile name
        #[arg(short, long, default_value = "default")]
        name: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print a profile with defaults filled in
    Show {
        /// Profile to show; the built-in defaults when omitted
        path: Option<PathBuf>,
    },

    /// Validate a profile and list every problem
    Check {
        /// Profile to check
        path: PathBuf,
    },
}

/// Run the config command.
pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Init { path, name, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            Profile::new(name).save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigCommand::Show { path } => {
            let profile = match path {
                Some(path) => Profile::load(path)?,
                None => Profile::default(),
            };
            print!("{}", profile.to_toml()?);
            Ok(())
        }
        ConfigCommand::Check { path } => {
            let profile = Profile::load(&path)?;
            match gmf_config::validate_profile(&profile) {
                Ok(()) => {
                    println!("{}: ok", path.display());
                    Ok(())
                }
                Err(ValidationError::Multiple(errors)) => {
                    for e in &errors {
                        println!("{}: {e}", path.display());
                    }
                    bail!("{} problems found", errors.len());
                }
                Err(e) => {
                    println!("{}: {e}", path.display());
                    bail!("1 problem found");
                }
            }
        }
    }
}
