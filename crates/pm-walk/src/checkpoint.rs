use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use pm_core::errors::{ErrorInfo, PmError};
use pm_model::CandidateModel;
use serde::{Deserialize, Serialize};

use crate::hiscore::write_atomic;

/// Counters accumulated by a walker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalkerStats {
    /// Accepted proposals.
    pub accepted: u64,
    /// Rejected proposals (rolled back).
    pub rejected: u64,
    /// Proposals vetoed as excluded.
    pub vetoed: u64,
    /// Steps voided by a caught failure.
    pub voided: u64,
    /// Teleports onto a leaderboard state.
    pub teleports: u64,
    /// Candidates published to the leaderboard.
    pub published: u64,
    /// Changes applied per operator label.
    pub operators: BTreeMap<String, u64>,
}

/// Everything a walker needs to continue exactly where it stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkerCheckpoint {
    /// Walker identity.
    pub walker_id: usize,
    /// Last completed step.
    pub step: u64,
    /// Master seed the per-step seeds derive from.
    pub master_seed: u64,
    /// Best score this walker has seen.
    pub best_score: f64,
    /// Step at which the best score was seen.
    pub best_step: u64,
    /// Accumulated counters.
    pub stats: WalkerStats,
    /// Current (accepted) model.
    pub model: CandidateModel,
    /// Configuration of the run.
    pub config: crate::config::RunConfig,
}

impl WalkerCheckpoint {
    /// Restores the payload from disk.
    pub fn load(path: &Path) -> Result<Self, PmError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            PmError::Checkpoint(
                ErrorInfo::new("checkpoint-read", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            PmError::Checkpoint(
                ErrorInfo::new("checkpoint-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the payload atomically so a crash never leaves a torn checkpoint.
    pub fn store(&self, path: &Path) -> Result<(), PmError> {
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            PmError::Checkpoint(
                ErrorInfo::new("checkpoint-serialize", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        write_atomic(path, json.as_bytes())
    }
}

/// Checkpoint file of a walker inside its private directory.
pub fn checkpoint_path(walker_dir: &Path) -> PathBuf {
    walker_dir.join("checkpoint.json")
}
