pub mod hiscores;
pub mod run;
pub mod seed;

use std::error::Error;
use std::path::{Path, PathBuf};

use pm_walk::RunConfig;

/// Loads a run configuration and points it at `out` when given.
pub fn load_config(path: &Path, out: Option<&PathBuf>) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = RunConfig::load(path)?;
    if let Some(out) = out {
        config.output.run_directory = Some(out.clone());
    }
    config.validate()?;
    Ok(config)
}
