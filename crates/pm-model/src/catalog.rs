use std::collections::BTreeMap;

use pm_core::errors::{ErrorInfo, PmError};
use serde::{Deserialize, Serialize};

use crate::particles::{DaughterSpec, ParticleId};

/// Search-space description: which particles exist, how they may decay and
/// which structural corrections apply to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleCatalog {
    /// Identifier of the lightest stable particle.
    #[serde(default = "default_lsp")]
    pub lsp: ParticleId,
    /// Every particle the search may unfreeze (the LSP included).
    #[serde(default = "default_ids")]
    pub ids: Vec<ParticleId>,
    /// Upper bound for any unfrozen mass, in GeV.
    #[serde(default = "default_max_mass")]
    pub max_mass: f64,
    /// Lower bound for the LSP mass, in GeV.
    #[serde(default = "default_min_mass")]
    pub min_mass: f64,
    /// Gap kept between the LSP and a state pushed up by an LSP move.
    #[serde(default = "default_min_gap")]
    pub min_gap: f64,
    /// Decay channels opened for a mother the first time it is unfrozen.
    #[serde(default = "default_template_decays")]
    pub template_decays: BTreeMap<ParticleId, Vec<DaughterSpec>>,
    /// Groups of ids that may be merged into a single state.
    #[serde(default = "default_mergeable")]
    pub mergeable: Vec<Vec<ParticleId>>,
    /// Mass gap (GeV) below which two mergeable states are merged.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f64,
    /// Pairs `(light, heavy)` whose naming convention requires `m(light) <= m(heavy)`.
    #[serde(default = "default_ordered_pairs")]
    pub ordered_pairs: Vec<(ParticleId, ParticleId)>,
    /// Subset of `ordered_pairs` whose swap is re-scored and reverted on regression.
    #[serde(default = "default_disambiguated_pairs")]
    pub disambiguated_pairs: Vec<(ParticleId, ParticleId)>,
}

fn default_lsp() -> ParticleId {
    1000022
}

fn default_ids() -> Vec<ParticleId> {
    vec![
        1000001, 1000002, 1000003, 1000004, 1000005, 2000005, 1000006, 2000006, 1000011, 1000013,
        1000015, 1000021, 1000022, 1000023, 1000024,
    ]
}

fn default_max_mass() -> f64 {
    2400.0
}

fn default_min_mass() -> f64 {
    1.0
}

fn default_min_gap() -> f64 {
    1.0
}

fn default_merge_threshold() -> f64 {
    200.0
}

fn default_template_decays() -> BTreeMap<ParticleId, Vec<DaughterSpec>> {
    let table: &[(ParticleId, &[&[ParticleId]])] = &[
        (1000001, &[&[1000022, 1], &[1000021, 1], &[1000024, 2], &[1000023, 1]]),
        (1000002, &[&[1000022, 2], &[1000021, 2], &[1000024, 1], &[1000023, 2]]),
        (1000003, &[&[1000022, 3], &[1000021, 3], &[1000023, 3]]),
        (1000004, &[&[1000022, 4], &[1000021, 4], &[1000023, 4]]),
        (1000005, &[&[1000022, 5], &[1000021, 5], &[1000024, 6], &[1000023, 5]]),
        (2000005, &[&[1000022, 5], &[1000005, 23], &[1000021, 5]]),
        (1000006, &[&[1000022, 6], &[1000024, 5], &[1000023, 6], &[1000021, 6]]),
        (2000006, &[&[1000022, 6], &[1000006, 23], &[1000006, 25]]),
        (1000011, &[&[1000022, 11], &[1000023, 11]]),
        (1000013, &[&[1000022, 13], &[1000023, 13]]),
        (1000015, &[&[1000022, 15]]),
        (
            1000021,
            &[
                &[1000022, 1, 1],
                &[1000022, 5, 5],
                &[1000022, 6, 6],
                &[1000006, 6],
                &[1000005, 5],
                &[1000023, 1, 1],
                &[1000024, 1, 2],
            ],
        ),
        (
            1000023,
            &[
                &[1000022, 23],
                &[1000022, 25],
                &[1000011, 11],
                &[1000013, 13],
                &[1000015, 15],
            ],
        ),
        (1000024, &[&[1000022, 24], &[1000011, 12]]),
    ];
    table
        .iter()
        .map(|(mother, channels)| {
            (
                *mother,
                channels
                    .iter()
                    .map(|ids| DaughterSpec::new(ids.to_vec()))
                    .collect(),
            )
        })
        .collect()
}

fn default_mergeable() -> Vec<Vec<ParticleId>> {
    vec![vec![1000001, 1000002, 1000003, 1000004], vec![1000011, 1000013]]
}

fn default_ordered_pairs() -> Vec<(ParticleId, ParticleId)> {
    vec![(1000005, 2000005), (1000006, 2000006)]
}

fn default_disambiguated_pairs() -> Vec<(ParticleId, ParticleId)> {
    vec![(1000006, 2000006)]
}

impl Default for ParticleCatalog {
    fn default() -> Self {
        Self {
            lsp: default_lsp(),
            ids: default_ids(),
            max_mass: default_max_mass(),
            min_mass: default_min_mass(),
            min_gap: default_min_gap(),
            template_decays: default_template_decays(),
            mergeable: default_mergeable(),
            merge_threshold: default_merge_threshold(),
            ordered_pairs: default_ordered_pairs(),
            disambiguated_pairs: default_disambiguated_pairs(),
        }
    }
}

impl ParticleCatalog {
    /// Checks the catalog for inconsistencies that would break the walkers.
    pub fn validate(&self) -> Result<(), PmError> {
        let invalid = |message: &str| PmError::Config(ErrorInfo::new("invalid-catalog", message));
        if !self.ids.contains(&self.lsp) {
            return Err(invalid("LSP is not part of the particle ids"));
        }
        if self.ids.iter().any(|id| *id <= 0) {
            return Err(invalid("particle ids must be positive"));
        }
        if !(self.min_mass > 0.0 && self.max_mass > self.min_mass + 2.0 * self.min_gap) {
            return Err(PmError::Config(
                ErrorInfo::new("invalid-catalog", "mass window is empty")
                    .with_context("min_mass", self.min_mass.to_string())
                    .with_context("max_mass", self.max_mass.to_string()),
            ));
        }
        for pair in self.ordered_pairs.iter().chain(&self.disambiguated_pairs) {
            if !self.ids.contains(&pair.0) || !self.ids.contains(&pair.1) {
                return Err(invalid("ordered pair references an unknown particle"));
            }
        }
        if self
            .disambiguated_pairs
            .iter()
            .any(|pair| !self.ordered_pairs.contains(pair))
        {
            return Err(invalid("disambiguated pairs must be a subset of ordered pairs"));
        }
        Ok(())
    }

    /// Template channels for `mother`, empty when none are configured.
    pub fn template_for(&self, mother: ParticleId) -> &[DaughterSpec] {
        self.template_decays
            .get(&mother)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when `(a, b)` belongs to the re-scored swap subset.
    pub fn is_disambiguated(&self, a: ParticleId, b: ParticleId) -> bool {
        self.disambiguated_pairs
            .iter()
            .any(|pair| (pair.0 == a && pair.1 == b) || (pair.0 == b && pair.1 == a))
    }
}
