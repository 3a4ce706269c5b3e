use pm_core::errors::PmError;
use pm_core::RngHandle;
use pm_model::{CandidateModel, ParticleCatalog};
use serde::{Deserialize, Serialize};

use crate::config::StepPolicy;
use crate::moves_couplings::{change_branchings, change_ssms};
use crate::moves_spectrum::{freeze_most_massive, freeze_random, random_mass_step, unfreeze_random};
use crate::moves_structure::{attempt_merger, check_swaps};
use crate::oracle::ScoreOracle;

/// Mutation operator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    /// Merge near-degenerate states.
    Merge,
    /// Restore the naming convention of ordered pairs.
    Swap,
    /// Unfreeze a particle.
    Unfreeze,
    /// Freeze a random particle.
    Freeze,
    /// Freeze the heaviest particle.
    FreezeMostMassive,
    /// Perturb branching ratios.
    Branchings,
    /// Perturb signal-strength multipliers.
    SignalStrengths,
    /// Random mass step.
    MassStep,
}

impl MutationKind {
    /// Stable label used in journals and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Merge => "merge",
            MutationKind::Swap => "swap",
            MutationKind::Unfreeze => "unfreeze",
            MutationKind::Freeze => "freeze",
            MutationKind::FreezeMostMassive => "freeze-most-massive",
            MutationKind::Branchings => "branchings",
            MutationKind::SignalStrengths => "signal-strengths",
            MutationKind::MassStep => "mass-step",
        }
    }
}

/// Result of applying one operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The model changed; the string describes how.
    Changed(String),
    /// Nothing applicable; the model is untouched.
    Unchanged,
}

impl MutationOutcome {
    /// True when the operator modified the model.
    pub fn is_changed(&self) -> bool {
        matches!(self, MutationOutcome::Changed(_))
    }
}

/// Operators fired during one proposal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    /// Every operator that was triggered, with its outcome.
    pub fired: Vec<(MutationKind, MutationOutcome)>,
}

impl Proposal {
    /// True when at least one operator changed the model.
    pub fn changed(&self) -> bool {
        self.fired.iter().any(|(_, outcome)| outcome.is_changed())
    }

    /// Human readable summary of the applied operators.
    pub fn describe(&self) -> String {
        let parts: Vec<&str> = self
            .fired
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                MutationOutcome::Changed(text) => Some(text.as_str()),
                MutationOutcome::Unchanged => None,
            })
            .collect();
        if parts.is_empty() {
            "no change".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Applies the mutation operators of one step with the configured probabilities.
#[derive(Debug, Clone)]
pub struct Mutator {
    catalog: ParticleCatalog,
    policy: StepPolicy,
}

impl Mutator {
    /// Creates a mutator over the catalog with the given policy.
    pub fn new(catalog: ParticleCatalog, policy: StepPolicy) -> Self {
        Self { catalog, policy }
    }

    /// Search-space catalog.
    pub fn catalog(&self) -> &ParticleCatalog {
        &self.catalog
    }

    /// Operator probabilities and bounds.
    pub fn policy(&self) -> &StepPolicy {
        &self.policy
    }

    /// Draws one proposal in place.
    ///
    /// Operators that consult the oracle (merger, disambiguated swaps) run
    /// first while the model's score is still current. When no operator
    /// changes anything a mass step is forced so every step proposes
    /// something new.
    pub fn propose(
        &self,
        model: &mut CandidateModel,
        oracle: &mut dyn ScoreOracle,
        rng: &mut RngHandle,
    ) -> Result<Proposal, PmError> {
        let score = model.score;
        let policy = &self.policy;
        let mut proposal = Proposal::default();

        if rng.chance(policy.merge.effective(score)) {
            let outcome = attempt_merger(model, &self.catalog, policy, oracle, rng)?;
            proposal.fired.push((MutationKind::Merge, outcome));
        }
        if rng.chance(policy.swap.effective(score)) {
            let outcome = check_swaps(model, &self.catalog, Some(&mut *oracle), rng)?;
            proposal.fired.push((MutationKind::Swap, outcome));
        }
        if rng.chance(policy.unfreeze.effective(score)) {
            let outcome = unfreeze_random(model, &self.catalog, rng);
            proposal.fired.push((MutationKind::Unfreeze, outcome));
        }
        if rng.chance(policy.freeze.effective(score)) {
            if rng.chance(policy.freeze_most_massive) {
                let outcome = freeze_most_massive(model, rng);
                proposal.fired.push((MutationKind::FreezeMostMassive, outcome));
            } else {
                let outcome = freeze_random(model, rng);
                proposal.fired.push((MutationKind::Freeze, outcome));
            }
        }
        if rng.chance(policy.branchings.effective(score)) {
            let outcome = change_branchings(model, policy, rng);
            proposal.fired.push((MutationKind::Branchings, outcome));
        }
        if rng.chance(policy.ssms.effective(score)) {
            let outcome = change_ssms(model, policy, rng);
            proposal.fired.push((MutationKind::SignalStrengths, outcome));
        }
        if rng.chance(policy.masses.effective(score)) || !proposal.changed() {
            let outcome = random_mass_step(model, &self.catalog, policy, rng);
            proposal.fired.push((MutationKind::MassStep, outcome));
        }
        model.remove_all_offshell_decays(rng);
        Ok(proposal)
    }

    /// Cheap relabeling pass run every few steps, without re-scoring.
    pub fn relabel(&self, model: &mut CandidateModel, rng: &mut RngHandle) -> MutationOutcome {
        check_swaps(model, &self.catalog, None, rng).unwrap_or(MutationOutcome::Unchanged)
    }
}
