use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use log::{error, info};
use pm_core::errors::{ErrorInfo, PmError};
use pm_model::load_state_dicts;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{checkpoint_path, WalkerCheckpoint};
use crate::config::RunConfig;
use crate::hiscore::write_atomic;
use crate::journal::ExceptionsLog;
use crate::oracle::build_oracle;
use crate::walker::{Walker, WalkerReport, WalkerStatus};

/// How walkers are isolated from each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMode {
    /// One rayon thread per walker; panics are caught per walker.
    Threads,
    /// One child process per walker running `<program> walk ...`.
    Processes {
        /// Executable providing the `walk` subcommand.
        program: PathBuf,
        /// Configuration file handed to the children.
        config_path: PathBuf,
    },
}

/// Options governing pool execution.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Continue from existing checkpoints when true.
    pub resume: bool,
    /// Isolation mode.
    pub mode: PoolMode,
    /// Worker threads in thread mode (0 = one per walker).
    pub threads: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            resume: false,
            mode: PoolMode::Threads,
            threads: 0,
        }
    }
}

/// Reports of every walker of a pool run, ordered by walker id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    /// Per-walker reports.
    pub walkers: Vec<WalkerReport>,
}

impl PoolReport {
    /// Number of walkers that died.
    pub fn failed(&self) -> usize {
        self.walkers.iter().filter(|report| !report.is_success()).count()
    }

    /// Walker with the best score.
    pub fn best(&self) -> Option<&WalkerReport> {
        self.walkers
            .iter()
            .filter(|report| report.is_success())
            .max_by(|a, b| a.best_score.total_cmp(&b.best_score))
    }
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>6} {:>7} {:>9} {:>6} {:>8} {:>8} {:>6} {:>6}  status",
            "walker", "steps", "best", "at", "accepted", "rejected", "vetoed", "voided"
        )?;
        for report in &self.walkers {
            let status = match &report.status {
                WalkerStatus::Completed => "completed".to_string(),
                WalkerStatus::Failed { error } => format!("failed: {error}"),
            };
            writeln!(
                f,
                "{:>6} {:>7} {:>9.3} {:>6} {:>8} {:>8} {:>6} {:>6}  {status}",
                report.walker_id,
                report.steps_completed,
                report.best_score,
                report.best_step,
                report.stats.accepted,
                report.stats.rejected,
                report.stats.vetoed,
                report.stats.voided,
            )?;
        }
        Ok(())
    }
}

/// Report file of a walker inside its private directory.
pub fn report_path(walker_dir: &Path) -> PathBuf {
    walker_dir.join("report.json")
}

/// Runs one walker to completion: from its checkpoint when resuming, from the
/// seed file when configured, otherwise from a random minimal spectrum.
pub fn run_walker(
    config: &RunConfig,
    walker_id: usize,
    resume: bool,
) -> Result<WalkerReport, PmError> {
    let walker_dir = config.output.walker_dir(walker_id);
    let checkpoint = walker_dir.as_deref().map(checkpoint_path);
    let mut walker = match checkpoint {
        Some(path) if resume && path.exists() => {
            let mut payload = WalkerCheckpoint::load(&path)?;
            payload.config.max_steps = config.max_steps;
            payload.config.output = config.output.clone();
            let oracle = build_oracle(&payload.config.oracle, walker_id);
            info!("walker {walker_id} resuming from {}", path.display());
            Walker::from_checkpoint(payload, oracle)?
        }
        _ => {
            let oracle = build_oracle(&config.oracle, walker_id);
            match &config.seed_file {
                Some(seed_file) => {
                    let states = load_state_dicts(seed_file)?;
                    let Some(state) = states.get(walker_id % states.len().max(1)) else {
                        return Err(PmError::Config(
                            ErrorInfo::new("empty-seed-file", "seed file holds no state")
                                .with_context("path", seed_file.display().to_string()),
                        ));
                    };
                    Walker::from_state_dict(config, walker_id, state, oracle)?
                }
                None => Walker::random_start(config, walker_id, oracle)?,
            }
        }
    };
    let report = walker.run()?;
    if let Some(dir) = walker_dir {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| PmError::Serde(ErrorInfo::new("report-serialize", err.to_string())))?;
        write_atomic(&report_path(&dir), json.as_bytes())?;
    }
    Ok(report)
}

/// Runs every walker of the configuration and collects their reports.
///
/// A walker that dies is recorded as failed; the others keep running.
pub fn run_pool(config: &RunConfig, options: &PoolOptions) -> Result<PoolReport, PmError> {
    config.validate()?;
    if let Some(dir) = &config.output.run_directory {
        fs::create_dir_all(dir).map_err(|err| PmError::io("run-dir", dir, err))?;
    }
    let exceptions = ExceptionsLog::new(config.output.resolve(&config.output.exceptions_file));
    let mut walkers = match &options.mode {
        PoolMode::Threads => run_threads(config, options, &exceptions)?,
        PoolMode::Processes {
            program,
            config_path,
        } => run_processes(config, options, program, config_path, &exceptions)?,
    };
    walkers.sort_by_key(|report| report.walker_id);
    let report = PoolReport { walkers };
    if let Some(dir) = &config.output.run_directory {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| PmError::Serde(ErrorInfo::new("report-serialize", err.to_string())))?;
        write_atomic(&dir.join("pool_report.json"), json.as_bytes())?;
    }
    info!(
        "pool finished: {} walkers, {} failed",
        report.walkers.len(),
        report.failed()
    );
    Ok(report)
}

fn run_threads(
    config: &RunConfig,
    options: &PoolOptions,
    exceptions: &ExceptionsLog,
) -> Result<Vec<WalkerReport>, PmError> {
    let threads = if options.threads == 0 {
        config.walkers
    } else {
        options.threads
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|err| PmError::Pool(ErrorInfo::new("thread-pool", err.to_string())))?;
    Ok(pool.install(|| {
        (0..config.walkers)
            .into_par_iter()
            .map(|walker_id| {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| run_walker(config, walker_id, options.resume)));
                let err = match outcome {
                    Ok(Ok(report)) => return report,
                    Ok(Err(err)) => err,
                    Err(payload) => PmError::Pool(
                        ErrorInfo::new("walker-panic", panic_message(payload.as_ref()))
                            .with_context("walker", walker_id.to_string()),
                    ),
                };
                error!("walker {walker_id} died: {err}");
                exceptions.record(walker_id, 0, &err);
                WalkerReport::failed(walker_id, &err)
            })
            .collect()
    }))
}

fn run_processes(
    config: &RunConfig,
    options: &PoolOptions,
    program: &Path,
    config_path: &Path,
    exceptions: &ExceptionsLog,
) -> Result<Vec<WalkerReport>, PmError> {
    let Some(run_dir) = &config.output.run_directory else {
        return Err(PmError::Config(
            ErrorInfo::new("no-run-directory", "process mode exchanges reports through disk")
                .with_hint("set output.run_directory or pass --out"),
        ));
    };
    let mut children: Vec<(usize, Result<Child, PmError>)> = Vec::with_capacity(config.walkers);
    for walker_id in 0..config.walkers {
        let mut command = Command::new(program);
        command
            .arg("walk")
            .arg("--config")
            .arg(config_path)
            .arg("--walker-id")
            .arg(walker_id.to_string())
            .arg("--out")
            .arg(run_dir);
        if options.resume {
            command.arg("--resume");
        }
        let child = command.spawn().map_err(|err| {
            PmError::Pool(
                ErrorInfo::new("walker-spawn", err.to_string())
                    .with_context("walker", walker_id.to_string()),
            )
        });
        children.push((walker_id, child));
    }

    let mut reports = Vec::with_capacity(children.len());
    for (walker_id, child) in children {
        let outcome = child.and_then(|mut child| {
            let status = child.wait().map_err(|err| {
                PmError::Pool(ErrorInfo::new("walker-wait", err.to_string()))
            })?;
            if !status.success() {
                return Err(PmError::Pool(
                    ErrorInfo::new("walker-exit", "walker process failed")
                        .with_context("walker", walker_id.to_string())
                        .with_context("status", status.to_string()),
                ));
            }
            load_report(&report_path(&run_dir.join(format!("walker{walker_id}"))))
        });
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) => {
                error!("walker {walker_id} died: {err}");
                exceptions.record(walker_id, 0, &err);
                reports.push(WalkerReport::failed(walker_id, &err));
            }
        }
    }
    Ok(reports)
}

fn load_report(path: &Path) -> Result<WalkerReport, PmError> {
    let contents = fs::read_to_string(path).map_err(|err| PmError::io("report-read", path, err))?;
    serde_json::from_str(&contents).map_err(|err| {
        PmError::Serde(
            ErrorInfo::new("report-parse", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "walker panicked".to_string()
    }
}
