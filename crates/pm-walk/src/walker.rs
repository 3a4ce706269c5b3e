use std::path::PathBuf;

use log::{info, warn};
use pm_core::errors::{ErrorInfo, PmError};
use pm_core::RngHandle;
use pm_model::{CandidateModel, StateDict};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{checkpoint_path, WalkerCheckpoint, WalkerStats};
use crate::config::{AcceptanceRule, RunConfig};
use crate::determinism;
use crate::hiscore::{ConsiderOutcome, HiscorePaths, Hiscores};
use crate::journal::{ExceptionsLog, WalkerJournal};
use crate::mutator::Mutator;
use crate::oracle::ScoreOracle;
use crate::ranked::pick_teleport_target;

/// What happened during one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// The proposal became the new state.
    Accepted {
        /// Score of the accepted model.
        score: f64,
    },
    /// The proposal was rolled back by the Metropolis rule.
    Rejected {
        /// Score of the rejected proposal.
        score: f64,
    },
    /// The proposal was excluded and rolled back without a draw.
    Vetoed {
        /// Exclusion ratio of the vetoed proposal.
        rmax: f64,
    },
    /// A caught failure voided the step.
    Voided,
}

/// Final state of a walker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum WalkerStatus {
    /// Ran to its step budget.
    Completed,
    /// Died with an error; the rest of the pool kept running.
    Failed {
        /// Rendered error.
        error: String,
    },
}

/// Summary of one walker written next to its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkerReport {
    /// Walker identity.
    pub walker_id: usize,
    /// Last completed step.
    pub steps_completed: u64,
    /// Best score this walker accepted.
    pub best_score: f64,
    /// Step of the best score.
    pub best_step: u64,
    /// Score of the final state.
    pub final_score: f64,
    /// Counters.
    pub stats: WalkerStats,
    /// Completion status.
    pub status: WalkerStatus,
}

impl WalkerReport {
    /// Report for a walker that could not run at all or died.
    pub fn failed(walker_id: usize, error: &PmError) -> Self {
        Self {
            walker_id,
            steps_completed: 0,
            best_score: 0.0,
            best_step: 0,
            final_score: 0.0,
            stats: WalkerStats::default(),
            status: WalkerStatus::Failed {
                error: error.to_string(),
            },
        }
    }

    /// True when the walker completed its budget.
    pub fn is_success(&self) -> bool {
        matches!(self.status, WalkerStatus::Completed)
    }
}

/// The quantity compared by the acceptance rule.
pub fn acceptance_metric(rule: AcceptanceRule, model: &CandidateModel) -> f64 {
    match rule {
        AcceptanceRule::Bayesian => model.score,
        AcceptanceRule::Significance => model.significance,
    }
}

/// Metropolis ratio between the old and the proposed metric.
///
/// A non-finite proposal is never accepted.
pub fn acceptance_ratio(rule: AcceptanceRule, old: f64, new: f64) -> f64 {
    if !new.is_finite() {
        return 0.0;
    }
    let old = if old.is_finite() { old } else { 0.0 };
    match rule {
        AcceptanceRule::Bayesian => (0.5 * (new - old)).exp(),
        AcceptanceRule::Significance => (0.5 * (new * new - old * old)).exp(),
    }
}

/// Single stochastic search trajectory.
pub struct Walker {
    walker_id: usize,
    config: RunConfig,
    master_seed: u64,
    mutator: Mutator,
    oracle: Box<dyn ScoreOracle>,
    model: CandidateModel,
    hiscores: Hiscores,
    journal: WalkerJournal,
    exceptions: ExceptionsLog,
    stats: WalkerStats,
    best_score: f64,
    best_step: u64,
}

impl Walker {
    /// Walker starting from the minimal spectrum: the LSP at a random mass,
    /// everything else frozen.
    pub fn random_start(
        config: &RunConfig,
        walker_id: usize,
        oracle: Box<dyn ScoreOracle>,
    ) -> Result<Self, PmError> {
        let model = random_start_model(config, walker_id);
        Self::from_model(config, walker_id, model, oracle)
    }

    /// Walker starting from a seed-file state dictionary.
    pub fn from_state_dict(
        config: &RunConfig,
        walker_id: usize,
        state: &StateDict,
        oracle: Box<dyn ScoreOracle>,
    ) -> Result<Self, PmError> {
        let mut model = state.to_model(&config.particles, walker_id)?;
        model.step = 0;
        model.clear_scores();
        let mut rng = RngHandle::from_seed(determinism::start_seed(
            config.seed_policy.master_seed,
            walker_id,
        ));
        admit_state(&mut model, &mut rng)?;
        Self::from_model(config, walker_id, model, oracle)
    }

    /// Walker continuing a checkpoint. The checkpointed model is the
    /// accepted state and becomes the backup baseline without re-scoring.
    pub fn from_checkpoint(
        checkpoint: WalkerCheckpoint,
        oracle: Box<dyn ScoreOracle>,
    ) -> Result<Self, PmError> {
        let WalkerCheckpoint {
            walker_id,
            step,
            master_seed,
            best_score,
            best_step,
            stats,
            mut model,
            config,
        } = checkpoint;
        if model.step != step {
            return Err(PmError::Checkpoint(
                ErrorInfo::new("checkpoint-step", "model step does not match checkpoint")
                    .with_context("walker", walker_id.to_string()),
            ));
        }
        model.backup();
        let mut walker = Self::from_model(&config, walker_id, model, oracle)?;
        walker.master_seed = master_seed;
        walker.best_score = best_score;
        walker.best_step = best_step;
        walker.stats = stats;
        walker.journal.line(format_args!("resumed at step {step}"));
        Ok(walker)
    }

    fn from_model(
        config: &RunConfig,
        walker_id: usize,
        model: CandidateModel,
        oracle: Box<dyn ScoreOracle>,
    ) -> Result<Self, PmError> {
        config.validate()?;
        let hiscores = match HiscorePaths::from_output(&config.output) {
            Some(paths) => Hiscores::persistent(config.hiscore.clone(), paths),
            None => Hiscores::in_memory(config.hiscore.clone()),
        };
        let journal = match &config.output.run_directory {
            Some(dir) => WalkerJournal::open(&dir.join(format!("walker{walker_id}.log")), walker_id)?,
            None => WalkerJournal::detached(walker_id),
        };
        let exceptions = ExceptionsLog::new(config.output.resolve(&config.output.exceptions_file));
        Ok(Self {
            walker_id,
            master_seed: config.seed_policy.master_seed,
            mutator: Mutator::new(config.particles.clone(), config.policy.clone()),
            config: config.clone(),
            oracle,
            best_score: model.score,
            best_step: model.step,
            model,
            hiscores,
            journal,
            exceptions,
            stats: WalkerStats::default(),
        })
    }

    /// Walker identity.
    pub fn walker_id(&self) -> usize {
        self.walker_id
    }

    /// Current accepted model.
    pub fn model(&self) -> &CandidateModel {
        &self.model
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &WalkerStats {
        &self.stats
    }

    /// This walker's view of the leaderboard.
    pub fn hiscores(&self) -> &Hiscores {
        &self.hiscores
    }

    /// Best accepted score and its step.
    pub fn best(&self) -> (f64, u64) {
        (self.best_score, self.best_step)
    }

    /// Scores the starting model and makes it the backup baseline.
    pub fn initialize(&mut self) -> Result<(), PmError> {
        if self.model.has_backup() {
            return Ok(());
        }
        if let Err(err) = self.oracle.evaluate(&mut self.model) {
            if !self.config.catch_exceptions {
                return Err(err);
            }
            self.exceptions.record(self.walker_id, self.model.step, &err);
            self.model.clear_scores();
        }
        self.model.backup();
        self.best_score = self.model.score;
        self.best_step = self.model.step;
        self.journal.line(format_args!(
            "initialized at {} with score {:.3}",
            self.model.describe(),
            self.model.score
        ));
        let start = self.model.detached();
        self.publish(&start);
        Ok(())
    }

    /// Runs until the step budget is exhausted and writes the final checkpoint.
    pub fn run(&mut self) -> Result<WalkerReport, PmError> {
        self.initialize()?;
        let label = self.config.seed_policy.label.as_deref().unwrap_or("-");
        self.journal.line(format_args!(
            "walking from step {} (seed label {label})",
            self.model.step
        ));
        while self
            .config
            .max_steps
            .map_or(true, |max| self.model.step < max)
        {
            self.step()?;
        }
        self.write_checkpoint()?;
        info!(
            "walker {} finished at step {} with best score {:.3}",
            self.walker_id, self.model.step, self.best_score
        );
        Ok(self.report())
    }

    /// Performs one step: mutate, score, veto or accept/reject, publish,
    /// maybe teleport, maybe checkpoint.
    pub fn step(&mut self) -> Result<StepOutcome, PmError> {
        self.initialize()?;
        let step = self.model.step + 1;
        self.model.step = step;
        let rule = self.config.acceptance;
        let mut rng = RngHandle::from_seed(determinism::step_seed(
            self.master_seed,
            self.walker_id,
            step,
        ));
        let old_metric = acceptance_metric(rule, &self.model);
        self.journal.line(format_args!(
            "step {step}: {} unfrozen",
            self.model.unfrozen_particles(true).len()
        ));

        let interval = self.config.policy.swap_check_interval;
        if interval > 0 && step % interval == 0 {
            let relabeled = self.mutator.relabel(&mut self.model, &mut rng);
            if relabeled.is_changed() {
                *self.stats.operators.entry("relabel".to_string()).or_insert(0) += 1;
            }
        }

        let proposal = match self
            .mutator
            .propose(&mut self.model, self.oracle.as_mut(), &mut rng)
        {
            Ok(proposal) => proposal,
            Err(err) => return self.void_step(step, err),
        };
        for (kind, outcome) in &proposal.fired {
            if outcome.is_changed() {
                *self.stats.operators.entry(kind.as_str().to_string()).or_insert(0) += 1;
            }
        }
        let violations = self.model.invariant_violations();
        if !violations.is_empty() {
            let err = PmError::Mutation(
                ErrorInfo::new("invariant-violation", violations.join("; "))
                    .with_context("proposal", proposal.describe()),
            );
            return self.void_step(step, err);
        }

        let merit = match self.oracle.evaluate(&mut self.model) {
            Ok(merit) => merit,
            Err(err) => return self.void_step(step, err),
        };
        let rmax = self.model.rmax;
        let vetoed = merit.excluded
            || !rmax.is_finite()
            || rmax > self.config.policy.exclusion_threshold;
        let proposed = (!vetoed).then(|| self.model.detached());
        let outcome = if vetoed {
            self.model.restore()?;
            self.stats.vetoed += 1;
            self.journal.line(format_args!(
                "step {step}: vetoed {} (rmax {rmax:.3})",
                proposal.describe()
            ));
            StepOutcome::Vetoed { rmax }
        } else {
            let new_metric = acceptance_metric(rule, &self.model);
            let ratio = acceptance_ratio(rule, old_metric, new_metric);
            let score = self.model.score;
            if ratio >= 1.0 || rng.unit() < ratio {
                self.model.backup();
                self.stats.accepted += 1;
                if score > self.best_score {
                    self.best_score = score;
                    self.best_step = step;
                }
                self.journal.line(format_args!(
                    "step {step}: accepted {} score {score:.3}",
                    proposal.describe()
                ));
                StepOutcome::Accepted { score }
            } else {
                self.model.restore()?;
                self.stats.rejected += 1;
                self.journal.line(format_args!(
                    "step {step}: rejected {} score {score:.3} (ratio {ratio:.3})",
                    proposal.describe()
                ));
                StepOutcome::Rejected { score }
            }
        };

        if let Some(proposed) = proposed {
            self.publish(&proposed);
        }
        self.maybe_teleport(&mut rng);

        let every = self.config.checkpoint.interval;
        if every > 0 && step % every == 0 {
            self.write_checkpoint()?;
        }
        Ok(outcome)
    }

    fn void_step(&mut self, step: u64, err: PmError) -> Result<StepOutcome, PmError> {
        if !self.config.catch_exceptions {
            return Err(err);
        }
        self.exceptions.record(self.walker_id, step, &err);
        self.journal.line(format_args!("step {step}: voided ({})", err.code()));
        self.model.restore()?;
        self.stats.voided += 1;
        Ok(StepOutcome::Voided)
    }

    /// Offers `candidate` to the shared board whatever the local outcome was.
    fn publish(&mut self, candidate: &CandidateModel) {
        match self.hiscores.consider(candidate) {
            Ok(outcome) => {
                if let ConsiderOutcome::Inserted { .. } = outcome {
                    self.stats.published += 1;
                    self.journal.line(format_args!(
                        "step {}: hiscore {outcome}",
                        candidate.step
                    ));
                }
            }
            Err(err) => self.exceptions.record(self.walker_id, candidate.step, &err),
        }
    }

    fn maybe_teleport(&mut self, rng: &mut RngHandle) {
        let policy = &self.config.policy;
        if !rng.chance(policy.teleport_probability) {
            return;
        }
        if self.hiscores.global_best() - self.model.score < policy.teleport_margin {
            return;
        }
        let Some(path) = self.hiscores.paths().map(|paths| paths.states.clone()) else {
            return;
        };
        let state = match pick_teleport_target(&path, rng) {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                warn!("walker {} cannot read ranked states: {err}", self.walker_id);
                return;
            }
        };
        let mut target = match state.to_model(&self.config.particles, self.walker_id) {
            Ok(model) => model,
            Err(err) => {
                self.exceptions.record(self.walker_id, self.model.step, &err);
                return;
            }
        };
        target.step = self.model.step;
        if let Err(err) = admit_state(&mut target, rng) {
            self.exceptions.record(self.walker_id, self.model.step, &err);
            return;
        }
        if let Err(err) = self.oracle.evaluate(&mut target) {
            self.exceptions.record(self.walker_id, self.model.step, &err);
            return;
        }
        self.journal.line(format_args!(
            "step {}: teleported from score {:.3} to {:.3} (state of walker {})",
            self.model.step, self.model.score, target.score, state.walker_id
        ));
        target.backup();
        self.model = target;
        self.stats.teleports += 1;
        if self.model.score > self.best_score {
            self.best_score = self.model.score;
            self.best_step = self.model.step;
        }
    }

    /// Snapshot of everything needed to resume.
    pub fn checkpoint(&self) -> WalkerCheckpoint {
        WalkerCheckpoint {
            walker_id: self.walker_id,
            step: self.model.step,
            master_seed: self.master_seed,
            best_score: self.best_score,
            best_step: self.best_step,
            stats: self.stats.clone(),
            model: self.model.detached(),
            config: self.config.clone(),
        }
    }

    /// Writes the checkpoint into the walker directory, if the run has one.
    pub fn write_checkpoint(&self) -> Result<Option<PathBuf>, PmError> {
        let Some(dir) = self.config.output.walker_dir(self.walker_id) else {
            return Ok(None);
        };
        let path = checkpoint_path(&dir);
        self.checkpoint().store(&path)?;
        Ok(Some(path))
    }

    /// Summary of the walker so far.
    pub fn report(&self) -> WalkerReport {
        WalkerReport {
            walker_id: self.walker_id,
            steps_completed: self.model.step,
            best_score: self.best_score,
            best_step: self.best_step,
            final_score: self.model.score,
            stats: self.stats.clone(),
            status: WalkerStatus::Completed,
        }
    }
}

/// Repairs an externally supplied state: closes off-shell decays and raises
/// particles lighter than the LSP. A state that still violates an invariant
/// is refused.
fn admit_state(model: &mut CandidateModel, rng: &mut RngHandle) -> Result<(), PmError> {
    model.remove_all_offshell_decays(rng);
    model.lift_below_lsp(rng);
    let violations = model.invariant_violations();
    if violations.is_empty() {
        return Ok(());
    }
    Err(PmError::Model(
        ErrorInfo::new("invalid-state", violations.join("; "))
            .with_hint("check the seed or ranked-states file"),
    ))
}

/// Minimal starting model with the LSP at a random mass in the lower half of
/// the catalog window.
pub fn random_start_model(config: &RunConfig, walker_id: usize) -> CandidateModel {
    let catalog = &config.particles;
    let mut rng = RngHandle::from_seed(determinism::start_seed(
        config.seed_policy.master_seed,
        walker_id,
    ));
    let lsp_mass = rng.uniform(catalog.min_mass, 0.5 * catalog.max_mass);
    CandidateModel::minimal(catalog, lsp_mass, walker_id)
}
