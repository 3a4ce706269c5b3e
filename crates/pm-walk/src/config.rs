use std::fs;
use std::path::{Path, PathBuf};

use pm_core::errors::{ErrorInfo, PmError};
use pm_model::{ParticleCatalog, ParticleId};
use serde::{Deserialize, Serialize};

/// YAML-configurable parameters governing a walker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of walkers started by the pool.
    #[serde(default = "default_walkers")]
    pub walkers: usize,
    /// Steps per walker; `None` runs until the process is stopped.
    #[serde(default = "default_max_steps")]
    pub max_steps: Option<u64>,
    /// Catch oracle failures per step instead of terminating the walker.
    #[serde(default = "default_catch_exceptions")]
    pub catch_exceptions: bool,
    /// Which figure of merit drives the accept/reject rule.
    #[serde(default)]
    pub acceptance: AcceptanceRule,
    /// Master seed and substream policy.
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Search-space catalog.
    #[serde(default)]
    pub particles: ParticleCatalog,
    /// Operator probabilities and perturbation bounds.
    #[serde(default)]
    pub policy: StepPolicy,
    /// Shared leaderboard behaviour.
    #[serde(default)]
    pub hiscore: HiscoreConfig,
    /// Score oracle selection.
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Output layout.
    #[serde(default)]
    pub output: OutputConfig,
    /// Checkpointing behaviour.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Optional seed file (state dictionaries) used instead of a random start.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
}

fn default_walkers() -> usize {
    1
}

fn default_max_steps() -> Option<u64> {
    Some(1000)
}

fn default_catch_exceptions() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            walkers: default_walkers(),
            max_steps: default_max_steps(),
            catch_exceptions: default_catch_exceptions(),
            acceptance: AcceptanceRule::default(),
            seed_policy: SeedPolicy::default(),
            particles: ParticleCatalog::default(),
            policy: StepPolicy::default(),
            hiscore: HiscoreConfig::default(),
            oracle: OracleConfig::default(),
            output: OutputConfig::default(),
            checkpoint: CheckpointConfig::default(),
            seed_file: None,
        }
    }
}

impl RunConfig {
    /// Loads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self, PmError> {
        let contents = fs::read_to_string(path).map_err(|err| PmError::io("config-read", path, err))?;
        let config: RunConfig = serde_yaml::from_str(&contents).map_err(|err| {
            PmError::Config(
                ErrorInfo::new("config-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section for values the walkers cannot work with.
    pub fn validate(&self) -> Result<(), PmError> {
        if self.walkers == 0 {
            return Err(PmError::Config(ErrorInfo::new(
                "no-walkers",
                "at least one walker is required",
            )));
        }
        if self.hiscore.capacity == 0 {
            return Err(PmError::Config(ErrorInfo::new(
                "hiscore-capacity",
                "hiscore capacity must be positive",
            )));
        }
        self.particles.validate()?;
        self.policy.validate()
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, PmError> {
        serde_yaml::to_string(self)
            .map_err(|err| PmError::Serde(ErrorInfo::new("config-serialize", err.to_string())))
    }
}

/// Figure of merit used by the accept/reject rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptanceRule {
    /// Bayesian K: `r = exp(0.5 * (K_new - K_old))`.
    #[default]
    Bayesian,
    /// Significance Z: `r = exp(0.5 * (Z_new^2 - Z_old^2))`.
    Significance,
}

/// Deterministic seeding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Master seed used for the run.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Optional label recorded in walker journals.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_master_seed() -> u64 {
    0x05EE_D5EE_DD15_5EED_u64
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            master_seed: default_master_seed(),
            label: None,
        }
    }
}

/// Trigger probability of one operator family.
///
/// The effective probability shrinks as the running score grows:
/// `probability / (1 + score_damping * max(score, 0))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatorKnob {
    /// Probability at score zero.
    pub probability: f64,
    /// How quickly the probability decays with the score.
    #[serde(default)]
    pub score_damping: f64,
}

impl OperatorKnob {
    /// Creates a knob.
    pub const fn new(probability: f64, score_damping: f64) -> Self {
        Self {
            probability,
            score_damping,
        }
    }

    /// Probability after annealing against `score`.
    pub fn effective(&self, score: f64) -> f64 {
        let score = if score.is_finite() { score.max(0.0) } else { 0.0 };
        self.probability / (1.0 + self.score_damping * score)
    }
}

/// Every trigger probability and perturbation bound of the step loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// Unfreeze a random frozen particle.
    #[serde(default = "default_unfreeze")]
    pub unfreeze: OperatorKnob,
    /// Freeze a particle.
    #[serde(default = "default_freeze")]
    pub freeze: OperatorKnob,
    /// Share of freezes that target the most massive particle.
    #[serde(default = "default_freeze_most_massive")]
    pub freeze_most_massive: f64,
    /// Perturb the branchings of a random particle.
    #[serde(default = "default_branchings")]
    pub branchings: OperatorKnob,
    /// Perturb signal-strength multipliers.
    #[serde(default = "default_ssms")]
    pub ssms: OperatorKnob,
    /// Attempt a merger of near-degenerate states.
    #[serde(default = "default_merge")]
    pub merge: OperatorKnob,
    /// Swap mislabeled ordered pairs.
    #[serde(default = "default_swap")]
    pub swap: OperatorKnob,
    /// Random mass step.
    #[serde(default = "default_masses")]
    pub masses: OperatorKnob,
    /// Mass step bound in GeV at score zero.
    #[serde(default = "default_mass_step")]
    pub mass_step: f64,
    /// Shrinks the mass step bound: `mass_step / (1 + mass_annealing * score)`.
    #[serde(default = "default_mass_annealing")]
    pub mass_annealing: f64,
    /// Move a single mass per step instead of every unfrozen mass.
    #[serde(default = "default_single_mass")]
    pub single_mass: bool,
    /// Bound of the additive branching perturbation.
    #[serde(default = "default_branching_step")]
    pub branching_step: f64,
    /// Probability of snapping a channel to zero.
    #[serde(default = "default_small_probability")]
    pub branching_snap_zero: f64,
    /// Probability of copying one channel's ratio onto another.
    #[serde(default = "default_small_probability")]
    pub branching_copy: f64,
    /// Probability of the per-particle multiplier mode (else the single-pair mode).
    #[serde(default = "default_half")]
    pub ssm_single_particle: f64,
    /// Half-width of the common multiplicative factor of the per-particle mode.
    #[serde(default = "default_ssm_factor_width")]
    pub ssm_factor_width: f64,
    /// Standard deviation of the Gaussian factor of the single-pair mode.
    #[serde(default = "default_ssm_sigma")]
    pub ssm_sigma: f64,
    /// Probability of zeroing a random multiplier.
    #[serde(default = "default_tiny_probability")]
    pub ssm_zero: f64,
    /// Probability of resetting a random multiplier to one.
    #[serde(default = "default_tiny_probability")]
    pub ssm_reset: f64,
    /// Probability of copying one multiplier onto another.
    #[serde(default = "default_tiny_probability")]
    pub ssm_copy: f64,
    /// A merger is reverted when the score drops below this fraction of the old one.
    #[serde(default = "default_merge_regression")]
    pub merge_regression: f64,
    /// Probability of considering a teleport after a step.
    #[serde(default = "default_teleport_probability")]
    pub teleport_probability: f64,
    /// Required lead of the global best over the walker's score before teleporting.
    #[serde(default = "default_teleport_margin")]
    pub teleport_margin: f64,
    /// Steps between cheap relabeling passes (0 disables).
    #[serde(default = "default_swap_check_interval")]
    pub swap_check_interval: u64,
    /// Exclusion ratio above which a step is vetoed.
    #[serde(default = "default_exclusion_threshold")]
    pub exclusion_threshold: f64,
}

fn default_unfreeze() -> OperatorKnob {
    OperatorKnob::new(0.3, 0.1)
}

fn default_freeze() -> OperatorKnob {
    OperatorKnob::new(0.05, 0.0)
}

fn default_freeze_most_massive() -> f64 {
    0.3
}

fn default_branchings() -> OperatorKnob {
    OperatorKnob::new(0.3, 0.1)
}

fn default_ssms() -> OperatorKnob {
    OperatorKnob::new(0.3, 0.1)
}

fn default_merge() -> OperatorKnob {
    OperatorKnob::new(0.05, 0.0)
}

fn default_swap() -> OperatorKnob {
    OperatorKnob::new(0.1, 0.0)
}

fn default_masses() -> OperatorKnob {
    OperatorKnob::new(0.8, 0.0)
}

fn default_mass_step() -> f64 {
    100.0
}

fn default_mass_annealing() -> f64 {
    0.5
}

fn default_single_mass() -> bool {
    true
}

fn default_branching_step() -> f64 {
    0.1
}

fn default_small_probability() -> f64 {
    0.05
}

fn default_tiny_probability() -> f64 {
    0.02
}

fn default_half() -> f64 {
    0.5
}

fn default_ssm_factor_width() -> f64 {
    0.2
}

fn default_ssm_sigma() -> f64 {
    0.1
}

fn default_merge_regression() -> f64 {
    0.999
}

fn default_teleport_probability() -> f64 {
    0.03
}

fn default_teleport_margin() -> f64 {
    1.0
}

fn default_swap_check_interval() -> u64 {
    10
}

fn default_exclusion_threshold() -> f64 {
    1.38
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            unfreeze: default_unfreeze(),
            freeze: default_freeze(),
            freeze_most_massive: default_freeze_most_massive(),
            branchings: default_branchings(),
            ssms: default_ssms(),
            merge: default_merge(),
            swap: default_swap(),
            masses: default_masses(),
            mass_step: default_mass_step(),
            mass_annealing: default_mass_annealing(),
            single_mass: default_single_mass(),
            branching_step: default_branching_step(),
            branching_snap_zero: default_small_probability(),
            branching_copy: default_small_probability(),
            ssm_single_particle: default_half(),
            ssm_factor_width: default_ssm_factor_width(),
            ssm_sigma: default_ssm_sigma(),
            ssm_zero: default_tiny_probability(),
            ssm_reset: default_tiny_probability(),
            ssm_copy: default_tiny_probability(),
            merge_regression: default_merge_regression(),
            teleport_probability: default_teleport_probability(),
            teleport_margin: default_teleport_margin(),
            swap_check_interval: default_swap_check_interval(),
            exclusion_threshold: default_exclusion_threshold(),
        }
    }
}

impl StepPolicy {
    /// Rejects probabilities outside `[0, 1]` and non-positive bounds.
    pub fn validate(&self) -> Result<(), PmError> {
        let knobs = [
            ("unfreeze", self.unfreeze),
            ("freeze", self.freeze),
            ("branchings", self.branchings),
            ("ssms", self.ssms),
            ("merge", self.merge),
            ("swap", self.swap),
            ("masses", self.masses),
        ];
        for (name, knob) in knobs {
            check_probability(name, knob.probability)?;
            if !(knob.score_damping >= 0.0) {
                return Err(invalid_policy(name, "score damping must be non-negative"));
            }
        }
        let probabilities = [
            ("freeze_most_massive", self.freeze_most_massive),
            ("branching_snap_zero", self.branching_snap_zero),
            ("branching_copy", self.branching_copy),
            ("ssm_single_particle", self.ssm_single_particle),
            ("ssm_zero", self.ssm_zero),
            ("ssm_reset", self.ssm_reset),
            ("ssm_copy", self.ssm_copy),
            ("teleport_probability", self.teleport_probability),
            ("merge_regression", self.merge_regression),
        ];
        for (name, value) in probabilities {
            check_probability(name, value)?;
        }
        let bounds = [
            ("mass_step", self.mass_step),
            ("branching_step", self.branching_step),
            ("ssm_factor_width", self.ssm_factor_width),
            ("ssm_sigma", self.ssm_sigma),
            ("exclusion_threshold", self.exclusion_threshold),
        ];
        for (name, value) in bounds {
            if !(value > 0.0 && value.is_finite()) {
                return Err(invalid_policy(name, "bound must be positive and finite"));
            }
        }
        if self.ssm_factor_width >= 1.0 {
            return Err(invalid_policy(
                "ssm_factor_width",
                "factor width must stay below one",
            ));
        }
        if !(self.mass_annealing >= 0.0) || !(self.teleport_margin >= 0.0) {
            return Err(invalid_policy("annealing", "must be non-negative"));
        }
        Ok(())
    }

    /// Mass step bound annealed against the running score.
    pub fn mass_bound(&self, score: f64) -> f64 {
        let score = if score.is_finite() { score.max(0.0) } else { 0.0 };
        self.mass_step / (1.0 + self.mass_annealing * score)
    }
}

fn check_probability(name: &str, value: f64) -> Result<(), PmError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid_policy(name, "probability must lie in [0, 1]"))
    }
}

fn invalid_policy(name: &str, message: &str) -> PmError {
    PmError::Config(ErrorInfo::new("invalid-policy", message).with_context("field", name))
}

/// Shared leaderboard behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiscoreConfig {
    /// Number of slots.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Keep the previous record as `<file>.old` before each overwrite.
    #[serde(default = "default_true")]
    pub backups: bool,
    /// Bounded retries for reads, lock acquisition and stale writes.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Largest backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Drop the oracle payload from every slot but the top one before writing.
    #[serde(default = "default_true")]
    pub strip_combinations: bool,
}

fn default_capacity() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    20
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for HiscoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            backups: default_true(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            strip_combinations: default_true(),
        }
    }
}

/// Selects the [`crate::oracle::ScoreOracle`] implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OracleConfig {
    /// Analytic landscape, no external tools.
    Synthetic(SyntheticOracleConfig),
    /// External program scoring a state dictionary file.
    Command {
        /// Program to execute.
        program: PathBuf,
        /// Arguments placed before the artifact path.
        #[serde(default)]
        args: Vec<String>,
        /// Directory receiving the per-walker artifact files.
        #[serde(default)]
        workdir: Option<PathBuf>,
    },
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig::Synthetic(SyntheticOracleConfig::default())
    }
}

/// One mass hypothesis the synthetic landscape rewards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRegion {
    /// Particle that produces the excess.
    pub particle: ParticleId,
    /// Preferred mass in GeV.
    pub mass: f64,
    /// Gaussian width in GeV.
    pub width: f64,
    /// Peak significance contribution.
    pub strength: f64,
}

/// Parameters of the synthetic landscape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticOracleConfig {
    /// Rewarded mass hypotheses.
    #[serde(default = "default_signals")]
    pub signals: Vec<SignalRegion>,
    /// Mass scale below which uncompressed states are excluded.
    #[serde(default = "default_exclusion_mass")]
    pub exclusion_mass: f64,
    /// Exclusion ratio above which the oracle flags the model as excluded.
    #[serde(default = "default_exclusion_threshold")]
    pub excluded_above: f64,
    /// Score penalty per unfrozen particle.
    #[serde(default = "default_occam")]
    pub occam_penalty: f64,
    /// Fail every n-th call (fault injection for tests); 0 disables.
    #[serde(default)]
    pub fail_every: u64,
}

fn default_signals() -> Vec<SignalRegion> {
    vec![
        SignalRegion {
            particle: 1000006,
            mass: 1150.0,
            width: 120.0,
            strength: 2.5,
        },
        SignalRegion {
            particle: 1000021,
            mass: 1700.0,
            width: 150.0,
            strength: 2.0,
        },
    ]
}

fn default_exclusion_mass() -> f64 {
    600.0
}

fn default_occam() -> f64 {
    0.5
}

impl Default for SyntheticOracleConfig {
    fn default() -> Self {
        Self {
            signals: default_signals(),
            exclusion_mass: default_exclusion_mass(),
            excluded_above: default_exclusion_threshold(),
            occam_penalty: default_occam(),
            fail_every: 0,
        }
    }
}

/// Output directory layout configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for run artefacts; `None` keeps everything in memory.
    #[serde(default)]
    pub run_directory: Option<PathBuf>,
    /// Leaderboard record, relative to `run_directory`.
    #[serde(default = "default_hiscore_file")]
    pub hiscore_file: PathBuf,
    /// Ranked-states dictionary export, relative to `run_directory`.
    #[serde(default = "default_states_file")]
    pub states_file: PathBuf,
    /// Cutoff side file, relative to `run_directory`.
    #[serde(default = "default_cutoff_file")]
    pub cutoff_file: PathBuf,
    /// Shared exceptions log, relative to `run_directory`.
    #[serde(default = "default_exceptions_file")]
    pub exceptions_file: PathBuf,
}

fn default_hiscore_file() -> PathBuf {
    PathBuf::from("hiscores.bin")
}

fn default_states_file() -> PathBuf {
    PathBuf::from("states.json")
}

fn default_cutoff_file() -> PathBuf {
    PathBuf::from("hiscore.cutoff")
}

fn default_exceptions_file() -> PathBuf {
    PathBuf::from("exceptions.log")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            run_directory: None,
            hiscore_file: default_hiscore_file(),
            states_file: default_states_file(),
            cutoff_file: default_cutoff_file(),
            exceptions_file: default_exceptions_file(),
        }
    }
}

impl OutputConfig {
    /// Resolves a run-relative path, `None` without a run directory.
    pub fn resolve(&self, relative: &Path) -> Option<PathBuf> {
        self.run_directory.as_ref().map(|dir| dir.join(relative))
    }

    /// Private directory of one walker.
    pub fn walker_dir(&self, walker_id: usize) -> Option<PathBuf> {
        self.run_directory
            .as_ref()
            .map(|dir| dir.join(format!("walker{walker_id}")))
    }
}

/// Checkpointing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Steps between checkpoint writes (0 writes only at the end of the run).
    #[serde(default)]
    pub interval: u64,
}
