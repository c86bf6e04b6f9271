//! Profile lookup shared by the commands.

use std::path::Path;

use anyhow::Context;
use gmf_config::Profile;

/// Loads and validates `path`, or returns the default profile.
pub fn load(path: Option<&Path>) -> anyhow::Result<Profile> {
    let Some(path) = path else {
        return Ok(Profile::default());
    };
    let profile = Profile::load(path).with_context(|| format!("failed to load profile {}", path.display()))?;
    profile.validate()?;
    tracing::info!(name = %profile.name, path = %path.display(), "profile loaded");
    Ok(profile)
}
