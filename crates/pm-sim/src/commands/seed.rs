use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Args;
use log::info;
use pm_model::{state_dicts_to_json, StateDict};
use pm_walk::walker::random_start_model;

use super::load_config;

#[derive(Args, Debug)]
pub struct SeedArgs {
    /// YAML configuration providing the catalog and seed policy.
    #[arg(long)]
    pub config: PathBuf,
    /// Destination JSON file.
    #[arg(long)]
    pub out: PathBuf,
    /// Number of states (defaults to the configured walker count).
    #[arg(long)]
    pub count: Option<usize>,
}

pub fn run(args: &SeedArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config, None)?;
    let count = args.count.unwrap_or(config.walkers);
    let states: Vec<StateDict> = (0..count)
        .map(|walker_id| StateDict::from_model(&random_start_model(&config, walker_id)))
        .collect();
    if let Some(parent) = args.out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, state_dicts_to_json(&states)?)?;
    info!("wrote {count} starting states to {}", args.out.display());
    Ok(())
}
