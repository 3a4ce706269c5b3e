use std::env;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Args;
use log::{info, warn};
use pm_walk::{run_pool, run_walker, PoolMode, PoolOptions};

use super::load_config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// YAML configuration describing the run.
    #[arg(long)]
    pub config: PathBuf,
    /// Run directory, overriding `output.run_directory`.
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Continue every walker from its last checkpoint.
    #[arg(long)]
    pub resume: bool,
    /// Run walkers as threads of this process instead of child processes.
    #[arg(long)]
    pub threads: bool,
    /// Worker threads in thread mode (0 = one per walker).
    #[arg(long, default_value_t = 0)]
    pub num_threads: usize,
}

#[derive(Args, Debug)]
pub struct WalkArgs {
    /// YAML configuration describing the run.
    #[arg(long)]
    pub config: PathBuf,
    /// Walker to run.
    #[arg(long)]
    pub walker_id: usize,
    /// Run directory, overriding `output.run_directory`.
    #[arg(long)]
    pub out: Option<PathBuf>,
    /// Continue from the walker's last checkpoint.
    #[arg(long)]
    pub resume: bool,
}

pub fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config, args.out.as_ref())?;
    if let Some(dir) = &config.output.run_directory {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("config.yaml"), config.to_yaml()?)?;
    }
    let mode = if args.threads {
        PoolMode::Threads
    } else {
        PoolMode::Processes {
            program: env::current_exe()?,
            config_path: fs::canonicalize(&args.config)?,
        }
    };
    let options = PoolOptions {
        resume: args.resume,
        mode,
        threads: args.num_threads,
    };
    info!(
        "starting {} walkers ({})",
        config.walkers,
        if args.threads { "threads" } else { "processes" }
    );
    let report = run_pool(&config, &options)?;
    print!("{report}");
    if report.failed() > 0 {
        warn!("{} of {} walkers failed", report.failed(), report.walkers.len());
    }
    Ok(())
}

pub fn walk(args: &WalkArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config, args.out.as_ref())?;
    if let Some(dir) = config.output.walker_dir(args.walker_id) {
        fs::create_dir_all(dir)?;
    }
    let report = run_walker(&config, args.walker_id, args.resume)?;
    info!(
        "walker {} finished {} steps, best {:.3} at step {}",
        report.walker_id, report.steps_completed, report.best_score, report.best_step
    );
    Ok(())
}
