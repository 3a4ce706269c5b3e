use std::fs;
use std::path::PathBuf;
use std::process::Command;

use log::{debug, warn};
use pm_core::errors::{ErrorInfo, PmError};
use pm_model::{BestCombination, CandidateModel, PairKey, StateDict};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{OracleConfig, SyntheticOracleConfig};

/// Scalar outputs of one scoring call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureOfMerit {
    /// Primary score (higher is better).
    pub score: f64,
    /// Significance of the combined excess.
    #[serde(default)]
    pub significance: f64,
    /// Largest exclusion ratio over all constraints.
    #[serde(default)]
    pub exclusion_ratio: f64,
    /// Second-largest exclusion ratio.
    #[serde(default)]
    pub secondary_exclusion_ratio: f64,
    /// Best-fit signal strength.
    #[serde(default = "default_muhat")]
    pub muhat: f64,
    /// The oracle's own verdict that the model is excluded.
    #[serde(default)]
    pub excluded: bool,
    /// Opaque description of the winning combination of analyses.
    #[serde(default)]
    pub best_combination: Option<serde_json::Value>,
}

fn default_muhat() -> f64 {
    1.0
}

impl FigureOfMerit {
    /// Copies the scalars into the model's derived fields.
    pub fn apply_to(&self, model: &mut CandidateModel) {
        model.score = if self.score.is_finite() {
            self.score
        } else {
            warn!("oracle returned a non-finite score {}, using 0", self.score);
            0.0
        };
        model.significance = self.significance;
        model.rmax = self.exclusion_ratio;
        model.r2 = self.secondary_exclusion_ratio;
        model.muhat = self.muhat;
        model.best_combination = self.best_combination.as_ref().map(BestCombination::from_value);
    }
}

/// Handle to whatever intermediate product the scorer consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactHandle {
    /// The model itself is the artifact.
    InMemory,
    /// A file written for an external scorer.
    File(PathBuf),
}

/// External scoring collaborator of a walker.
///
/// Implementations may be slow and may fail; the walker turns a failure into
/// a voided step. Calls are never made concurrently on one oracle instance.
pub trait ScoreOracle: Send {
    /// Produces the scoreable artifact of `model` (for instance a spectrum file).
    fn produce_artifact(&mut self, model: &CandidateModel) -> Result<ArtifactHandle, PmError>;

    /// Scores a previously produced artifact.
    fn score(
        &mut self,
        model: &CandidateModel,
        artifact: &ArtifactHandle,
    ) -> Result<FigureOfMerit, PmError>;

    /// Produces the artifact, scores it and writes the results into `model`.
    fn evaluate(&mut self, model: &mut CandidateModel) -> Result<FigureOfMerit, PmError> {
        let artifact = self.produce_artifact(model)?;
        let merit = self.score(model, &artifact)?;
        merit.apply_to(model);
        Ok(merit)
    }
}

/// Builds the oracle selected by the configuration for one walker.
pub fn build_oracle(config: &OracleConfig, walker_id: usize) -> Box<dyn ScoreOracle> {
    match config {
        OracleConfig::Synthetic(params) => Box::new(SyntheticOracle::new(params.clone())),
        OracleConfig::Command {
            program,
            args,
            workdir,
        } => Box::new(CommandOracle::new(
            program.clone(),
            args.clone(),
            workdir.clone().unwrap_or_else(|| PathBuf::from(".")),
            walker_id,
        )),
    }
}

/// Deterministic analytic landscape with Gaussian signal regions and a
/// mass-dependent exclusion ratio.
#[derive(Debug, Clone)]
pub struct SyntheticOracle {
    config: SyntheticOracleConfig,
    calls: u64,
}

impl SyntheticOracle {
    /// Creates the oracle.
    pub fn new(config: SyntheticOracleConfig) -> Self {
        Self { config, calls: 0 }
    }

    /// Number of scoring calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn landscape(&self, model: &CandidateModel) -> FigureOfMerit {
        let mut z_squared = 0.0;
        let mut contributing = Vec::new();
        for region in &self.config.signals {
            let Some(mass) = model.mass(region.particle) else {
                continue;
            };
            if model.is_frozen(region.particle) || region.particle == model.lsp {
                continue;
            }
            let shape = (-0.5 * ((mass - region.mass) / region.width).powi(2)).exp();
            let production = model.ss_multiplier(PairKey::new(region.particle, -region.particle));
            let visible: f64 = model
                .decays
                .get(&region.particle)
                .map(|table| {
                    table
                        .iter()
                        .filter(|(channel, _)| channel.involves(model.lsp))
                        .map(|(_, ratio)| ratio)
                        .sum()
                })
                .unwrap_or(0.0);
            let strength = production * visible;
            let z = region.strength * shape * (2.0 * strength - strength * strength).max(0.0);
            if z > 0.1 {
                contributing.push(region.particle);
            }
            z_squared += z * z;
        }

        let lsp_mass = model.lsp_mass();
        let mut ratios: Vec<(f64, i64)> = model
            .unfrozen_particles(false)
            .into_iter()
            .filter_map(|pid| {
                let mass = model.mass(pid)?;
                let gap = (mass - lsp_mass).max(0.0);
                let compression = gap / (gap + 100.0);
                let production = model.ss_multiplier(PairKey::new(pid, -pid));
                let ratio = production * (self.config.exclusion_mass / mass).powi(4) * compression;
                Some((ratio, pid))
            })
            .collect();
        ratios.sort_by(|a, b| b.0.total_cmp(&a.0));
        let rmax = ratios.first().map(|r| r.0).unwrap_or(0.0);
        let r2 = ratios.get(1).map(|r| r.0).unwrap_or(0.0);

        let unfrozen = model.unfrozen_particles(true).len() as f64;
        let score = z_squared - self.config.occam_penalty * (unfrozen - 1.0).max(0.0);
        let muhat = if rmax > 0.0 { (1.0 / rmax).min(1.0) } else { 1.0 };
        FigureOfMerit {
            score,
            significance: z_squared.sqrt(),
            exclusion_ratio: rmax,
            secondary_exclusion_ratio: r2,
            muhat,
            excluded: rmax > self.config.excluded_above,
            best_combination: Some(json!({
                "signals": contributing,
                "leading": ratios.first().map(|r| r.1),
            })),
        }
    }
}

impl ScoreOracle for SyntheticOracle {
    fn produce_artifact(&mut self, _model: &CandidateModel) -> Result<ArtifactHandle, PmError> {
        Ok(ArtifactHandle::InMemory)
    }

    fn score(
        &mut self,
        model: &CandidateModel,
        _artifact: &ArtifactHandle,
    ) -> Result<FigureOfMerit, PmError> {
        self.calls += 1;
        if self.config.fail_every > 0 && self.calls % self.config.fail_every == 0 {
            return Err(PmError::Oracle(
                ErrorInfo::new("synthetic-failure", "injected scoring failure")
                    .with_context("call", self.calls.to_string()),
            ));
        }
        Ok(self.landscape(model))
    }
}

/// Scores models with an external program.
///
/// The program receives the path of a JSON state dictionary as its last
/// argument and prints a [`FigureOfMerit`] as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
    walker_id: usize,
}

impl CommandOracle {
    /// Creates an oracle running `program` from `workdir`.
    pub fn new(program: PathBuf, args: Vec<String>, workdir: PathBuf, walker_id: usize) -> Self {
        Self {
            program,
            args,
            workdir,
            walker_id,
        }
    }
}

impl ScoreOracle for CommandOracle {
    fn produce_artifact(&mut self, model: &CandidateModel) -> Result<ArtifactHandle, PmError> {
        fs::create_dir_all(&self.workdir)
            .map_err(|err| PmError::io("oracle-workdir", &self.workdir, err))?;
        let path = self
            .workdir
            .join(format!("walker{}_artifact.json", self.walker_id));
        let json = serde_json::to_string_pretty(&StateDict::from_model(model))
            .map_err(|err| PmError::Serde(ErrorInfo::new("artifact-serialize", err.to_string())))?;
        fs::write(&path, json).map_err(|err| PmError::io("artifact-write", &path, err))?;
        Ok(ArtifactHandle::File(path))
    }

    fn score(
        &mut self,
        _model: &CandidateModel,
        artifact: &ArtifactHandle,
    ) -> Result<FigureOfMerit, PmError> {
        let ArtifactHandle::File(path) = artifact else {
            return Err(PmError::Oracle(ErrorInfo::new(
                "missing-artifact",
                "command oracle needs a file artifact",
            )));
        };
        debug!("scoring {} with {}", path.display(), self.program.display());
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| {
                PmError::Oracle(
                    ErrorInfo::new("oracle-spawn", err.to_string())
                        .with_context("program", self.program.display().to_string()),
                )
            })?;
        if !output.status.success() {
            return Err(PmError::Oracle(
                ErrorInfo::new("oracle-status", "scoring program failed")
                    .with_context("status", output.status.to_string())
                    .with_context("stderr", String::from_utf8_lossy(&output.stderr).trim().to_string()),
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|err| {
            PmError::Oracle(
                ErrorInfo::new("oracle-output", err.to_string())
                    .with_context("program", self.program.display().to_string()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::RngHandle;
    use pm_model::ParticleCatalog;

    fn stop_model() -> CandidateModel {
        let catalog = ParticleCatalog::default();
        let mut model = CandidateModel::minimal(&catalog, 200.0, 0);
        model.masses.insert(1000006, 1150.0);
        let mut rng = RngHandle::from_seed(1);
        model.remove_all_offshell_decays(&mut rng);
        model
    }

    #[test]
    fn signal_region_rewards_the_peak() {
        let mut oracle = SyntheticOracle::new(SyntheticOracleConfig::default());
        let mut model = stop_model();
        let merit = oracle.evaluate(&mut model).unwrap();
        assert!(merit.score > 5.0, "score {}", merit.score);
        assert_eq!(model.score, merit.score);
        assert!(!merit.excluded);

        model.masses.insert(1000006, 1800.0);
        let shifted = oracle.evaluate(&mut model).unwrap();
        assert!(shifted.score < merit.score);
        assert_eq!(oracle.calls(), 2);
    }

    #[test]
    fn light_uncompressed_states_are_excluded() {
        let mut oracle = SyntheticOracle::new(SyntheticOracleConfig::default());
        let mut model = stop_model();
        model.masses.insert(1000006, 400.0);
        let merit = oracle.evaluate(&mut model).unwrap();
        assert!(merit.excluded);
        assert!(model.rmax > 1.38);
    }

    #[test]
    fn injected_failures_surface_as_oracle_errors() {
        let config = SyntheticOracleConfig {
            fail_every: 2,
            ..SyntheticOracleConfig::default()
        };
        let mut oracle = SyntheticOracle::new(config);
        let mut model = stop_model();
        assert!(oracle.evaluate(&mut model).is_ok());
        let err = oracle.evaluate(&mut model).unwrap_err();
        assert_eq!(err.code(), "synthetic-failure");
    }
}
