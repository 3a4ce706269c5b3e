use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use pm_core::errors::{ErrorInfo, PmError};
use serde::{Deserialize, Serialize};

use crate::catalog::ParticleCatalog;
use crate::model::{CandidateModel, DecayTable};
use crate::particles::{PairKey, ParticleId, FROZEN_MASS};

/// Plain dictionary form of a candidate, used for the ranked-states file and
/// for hand written seed models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    /// Masses of the unfrozen particles.
    pub masses: BTreeMap<ParticleId, f64>,
    /// Branchings of the unfrozen mothers.
    #[serde(default)]
    pub decays: BTreeMap<ParticleId, DecayTable>,
    /// Relevant signal-strength multipliers.
    #[serde(default)]
    pub ssmultipliers: BTreeMap<PairKey, f64>,
    /// Figure of merit at export time.
    #[serde(default)]
    pub score: f64,
    /// Step at which the state was produced.
    #[serde(default)]
    pub step: u64,
    /// Walker that produced the state.
    #[serde(default)]
    pub walker_id: usize,
    /// Free-form provenance note.
    #[serde(default)]
    pub comment: Option<String>,
}

impl StateDict {
    /// Exports the physically relevant content of `model`.
    pub fn from_model(model: &CandidateModel) -> Self {
        let unfrozen = model.unfrozen_particles(true);
        let masses = unfrozen
            .iter()
            .filter_map(|&pid| model.mass(pid).map(|mass| (pid, mass)))
            .collect();
        let decays = unfrozen
            .iter()
            .filter_map(|pid| {
                let table: DecayTable = model
                    .decays
                    .get(pid)?
                    .iter()
                    .filter(|(_, &ratio)| ratio > 0.0)
                    .map(|(channel, &ratio)| (channel.clone(), ratio))
                    .collect();
                (!table.is_empty()).then_some((*pid, table))
            })
            .collect();
        Self {
            masses,
            decays,
            ssmultipliers: model.relevant_ssmultipliers(),
            score: model.score,
            step: model.step,
            walker_id: model.walker_id,
            comment: model.comment.clone(),
        }
    }

    /// Rebuilds a full candidate on top of the catalog; particles absent from
    /// the dictionary are frozen and keep their template channels.
    pub fn to_model(
        &self,
        catalog: &ParticleCatalog,
        walker_id: usize,
    ) -> Result<CandidateModel, PmError> {
        let Some(&lsp_mass) = self.masses.get(&catalog.lsp) else {
            return Err(PmError::Model(
                ErrorInfo::new("missing-lsp", "state dictionary lacks the LSP mass")
                    .with_context("lsp", catalog.lsp.to_string()),
            ));
        };
        let mut model = CandidateModel::minimal(catalog, lsp_mass, walker_id);
        for (&pid, &mass) in &self.masses {
            if !mass.is_finite() || mass <= 0.0 {
                return Err(PmError::Model(
                    ErrorInfo::new("invalid-mass", "masses must be positive and finite")
                        .with_context("particle", pid.to_string())
                        .with_context("mass", mass.to_string()),
                ));
            }
            model.masses.insert(pid, mass.min(FROZEN_MASS));
        }
        for (&mother, table) in &self.decays {
            let entry = model.decays.entry(mother).or_default();
            for ratio in entry.values_mut() {
                *ratio = 0.0;
            }
            for (channel, &ratio) in table {
                entry.insert(channel.clone(), ratio);
            }
        }
        model.ssmultipliers = self.ssmultipliers.clone();
        model.score = self.score;
        model.step = self.step;
        model.comment = self.comment.clone();
        Ok(model)
    }
}

/// Reads a JSON list of state dictionaries.
pub fn load_state_dicts(path: &Path) -> Result<Vec<StateDict>, PmError> {
    let contents = fs::read_to_string(path).map_err(|err| PmError::io("states-read", path, err))?;
    serde_json::from_str(&contents).map_err(|err| {
        PmError::Serde(
            ErrorInfo::new("states-parse", err.to_string())
                .with_context("path", path.display().to_string()),
        )
    })
}

/// Renders a list of state dictionaries as pretty JSON.
pub fn state_dicts_to_json(states: &[StateDict]) -> Result<String, PmError> {
    serde_json::to_string_pretty(states)
        .map_err(|err| PmError::Serde(ErrorInfo::new("states-serialize", err.to_string())))
}
