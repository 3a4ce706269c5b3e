use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use pm_core::errors::{ErrorInfo, PmError};
use pm_core::RngHandle;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::catalog::ParticleCatalog;
use crate::particles::{is_frozen_mass, DaughterSpec, PairKey, ParticleId, FROZEN_MASS};

/// Branching ratios below this value count as closed.
pub const BR_EPSILON: f64 = 1e-5;

/// Relative tolerance used by [`CandidateModel::almost_same_as`].
pub const SAME_TOLERANCE: f64 = 1e-5;

/// Branching table of a single mother particle.
pub type DecayTable = BTreeMap<DaughterSpec, f64>;

/// Best-evidence combination returned by the oracle, kept as opaque JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestCombination(String);

impl BestCombination {
    /// Wraps an oracle payload.
    pub fn from_value(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    /// Parses the payload back into JSON.
    pub fn to_value(&self) -> Result<serde_json::Value, PmError> {
        serde_json::from_str(&self.0).map_err(|err| {
            PmError::Serde(ErrorInfo::new("best-combination-parse", err.to_string()))
        })
    }

    /// Size of the stored payload in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Field-level snapshot of everything a step may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    masses: BTreeMap<ParticleId, f64>,
    decays: BTreeMap<ParticleId, DecayTable>,
    ssmultipliers: BTreeMap<PairKey, f64>,
    score: f64,
    significance: f64,
    rmax: f64,
    r2: f64,
    muhat: f64,
    best_combination: Option<BestCombination>,
    step: u64,
}

/// One candidate protomodel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateModel {
    /// Identifier of the lightest stable particle.
    pub lsp: ParticleId,
    /// Particle masses in GeV; frozen particles sit at [`FROZEN_MASS`].
    pub masses: BTreeMap<ParticleId, f64>,
    /// Branching ratios per mother and channel.
    pub decays: BTreeMap<ParticleId, DecayTable>,
    /// Production cross-section multipliers; untouched pairs default to 1.
    pub ssmultipliers: BTreeMap<PairKey, f64>,
    /// Bayesian figure of merit K.
    pub score: f64,
    /// Significance Z.
    pub significance: f64,
    /// Largest observed exclusion ratio.
    pub rmax: f64,
    /// Second largest exclusion ratio.
    pub r2: f64,
    /// Signal strength resolution factor.
    pub muhat: f64,
    /// Opaque oracle payload, may be stripped.
    #[serde(default)]
    pub best_combination: Option<BestCombination>,
    /// Step counter of the owning walker.
    pub step: u64,
    /// Identity of the owning walker.
    pub walker_id: usize,
    /// Free-form provenance note.
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(skip)]
    backup: Option<Box<ModelSnapshot>>,
}

impl CandidateModel {
    /// Minimal model: every catalog particle frozen except the LSP at `lsp_mass`.
    pub fn minimal(catalog: &ParticleCatalog, lsp_mass: f64, walker_id: usize) -> Self {
        let masses = catalog
            .ids
            .iter()
            .map(|&pid| {
                let mass = if pid == catalog.lsp { lsp_mass } else { FROZEN_MASS };
                (pid, mass)
            })
            .collect();
        let decays = catalog
            .ids
            .iter()
            .filter(|&&pid| pid != catalog.lsp)
            .map(|&pid| {
                let table = catalog
                    .template_for(pid)
                    .iter()
                    .map(|channel| (channel.clone(), 0.0))
                    .collect();
                (pid, table)
            })
            .collect();
        Self {
            lsp: catalog.lsp,
            masses,
            decays,
            ssmultipliers: BTreeMap::new(),
            score: 0.0,
            significance: 0.0,
            rmax: 0.0,
            r2: 0.0,
            muhat: 1.0,
            best_combination: None,
            step: 0,
            walker_id,
            comment: None,
            backup: None,
        }
    }

    /// Mass of `pid`, `None` when the particle is unknown.
    pub fn mass(&self, pid: ParticleId) -> Option<f64> {
        self.masses.get(&pid.abs()).copied()
    }

    /// Mass of the LSP.
    pub fn lsp_mass(&self) -> f64 {
        self.mass(self.lsp).unwrap_or(0.0)
    }

    /// True when `pid` is unknown or sits above the freezing threshold.
    pub fn is_frozen(&self, pid: ParticleId) -> bool {
        self.mass(pid).map_or(true, is_frozen_mass)
    }

    /// Particles currently decoupled from the spectrum.
    pub fn frozen_particles(&self) -> Vec<ParticleId> {
        self.masses
            .iter()
            .filter(|(_, &mass)| is_frozen_mass(mass))
            .map(|(&pid, _)| pid)
            .collect()
    }

    /// Particles in the active spectrum, optionally without the LSP.
    pub fn unfrozen_particles(&self, with_lsp: bool) -> Vec<ParticleId> {
        self.masses
            .iter()
            .filter(|(&pid, &mass)| !is_frozen_mass(mass) && (with_lsp || pid != self.lsp))
            .map(|(&pid, _)| pid)
            .collect()
    }

    /// Representative mass of a channel: the summed masses of its known daughters.
    /// Standard model daughters are not in the mass table and count as massless.
    pub fn daughter_mass(&self, channel: &DaughterSpec) -> f64 {
        channel.ids().iter().filter_map(|&id| self.mass(id)).sum()
    }

    /// True when the channel is kinematically closed for `mother`.
    pub fn is_offshell(&self, mother: ParticleId, channel: &DaughterSpec) -> bool {
        match self.mass(mother) {
            Some(mother_mass) => self.daughter_mass(channel) > mother_mass,
            None => true,
        }
    }

    /// Channels of `mother` that are kinematically open.
    pub fn open_channels(&self, mother: ParticleId) -> Vec<DaughterSpec> {
        self.decays
            .get(&mother)
            .map(|table| {
                table
                    .keys()
                    .filter(|channel| !self.is_offshell(mother, channel))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Multiplier applied to the production of `pair` (1 when untouched).
    pub fn ss_multiplier(&self, pair: PairKey) -> f64 {
        self.ssmultipliers.get(&pair).copied().unwrap_or(1.0)
    }

    /// Production pairs among unfrozen non-LSP particles, including antiparticles.
    pub fn relevant_ss_pairs(&self) -> Vec<PairKey> {
        let active = self.unfrozen_particles(false);
        let mut pairs = BTreeSet::new();
        for (idx, &p) in active.iter().enumerate() {
            for &q in &active[idx..] {
                pairs.insert(PairKey::new(p, q));
                pairs.insert(PairKey::new(-p, -q));
                pairs.insert(PairKey::new(p, -q));
                pairs.insert(PairKey::new(-p, q));
            }
        }
        pairs.into_iter().collect()
    }

    /// Multipliers restricted to pairs made of unfrozen particles.
    pub fn relevant_ssmultipliers(&self) -> BTreeMap<PairKey, f64> {
        self.relevant_ss_pairs()
            .into_iter()
            .map(|pair| (pair, self.ss_multiplier(pair)))
            .collect()
    }

    /// Rescales the branchings of `pid` to sum to one.
    ///
    /// Negative or non-finite ratios are coerced to zero first. A table that
    /// sums to zero is re-drawn uniformly over its open channels. With
    /// `rescale_ssms` the multipliers of every pair containing `pid` absorb the
    /// normalization factor once per occurrence so that production times
    /// branching stays unchanged. Returns the applied factor.
    pub fn normalize_branchings(
        &mut self,
        pid: ParticleId,
        rescale_ssms: bool,
        rng: &mut RngHandle,
    ) -> f64 {
        let open = self.open_channels(pid);
        let Some(table) = self.decays.get_mut(&pid) else {
            return 1.0;
        };
        if table.is_empty() {
            return 1.0;
        }
        for (channel, ratio) in table.iter_mut() {
            if !ratio.is_finite() || *ratio < 0.0 {
                warn!("coercing invalid branching {ratio} of {pid} -> {channel} to zero");
                *ratio = 0.0;
            }
        }
        let total: f64 = table.values().sum();
        if total <= 0.0 {
            if open.is_empty() {
                debug!("particle {pid} has no open decay channel");
                return 1.0;
            }
            let mut redrawn = 0.0;
            for channel in &open {
                let value = rng.uniform(0.05, 1.0);
                table.insert(channel.clone(), value);
                redrawn += value;
            }
            for ratio in table.values_mut() {
                *ratio /= redrawn;
            }
            return 1.0;
        }
        for ratio in table.values_mut() {
            *ratio /= total;
        }
        if rescale_ssms && (total - 1.0).abs() > f64::EPSILON {
            let mut pairs: BTreeSet<PairKey> = self
                .ssmultipliers
                .keys()
                .filter(|pair| pair.occurrences(pid) > 0)
                .copied()
                .collect();
            pairs.extend(
                self.relevant_ss_pairs()
                    .into_iter()
                    .filter(|pair| pair.occurrences(pid) > 0),
            );
            for pair in pairs {
                let factor = total.powi(pair.occurrences(pid));
                let current = self.ss_multiplier(pair);
                self.ssmultipliers.insert(pair, current * factor);
            }
        }
        total
    }

    /// Closes every kinematically forbidden channel of the unfrozen mothers and
    /// renormalizes the affected tables.
    pub fn remove_all_offshell_decays(&mut self, rng: &mut RngHandle) {
        for mother in self.unfrozen_particles(false) {
            let closed: Vec<DaughterSpec> = match self.decays.get(&mother) {
                Some(table) => table
                    .iter()
                    .filter(|(channel, &ratio)| ratio != 0.0 && self.is_offshell(mother, channel))
                    .map(|(channel, _)| channel.clone())
                    .collect(),
                None => continue,
            };
            if let Some(table) = self.decays.get_mut(&mother) {
                for channel in &closed {
                    table.insert(channel.clone(), 0.0);
                }
            }
            self.normalize_branchings(mother, false, rng);
        }
    }

    /// Takes a deep copy of every mutable field.
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            masses: self.masses.clone(),
            decays: self.decays.clone(),
            ssmultipliers: self.ssmultipliers.clone(),
            score: self.score,
            significance: self.significance,
            rmax: self.rmax,
            r2: self.r2,
            muhat: self.muhat,
            best_combination: self.best_combination.clone(),
            step: self.step,
        }
    }

    /// Overwrites every mutable field from `snapshot`.
    pub fn restore_snapshot(&mut self, snapshot: &ModelSnapshot) {
        self.masses = snapshot.masses.clone();
        self.decays = snapshot.decays.clone();
        self.ssmultipliers = snapshot.ssmultipliers.clone();
        self.score = snapshot.score;
        self.significance = snapshot.significance;
        self.rmax = snapshot.rmax;
        self.r2 = snapshot.r2;
        self.muhat = snapshot.muhat;
        self.best_combination = snapshot.best_combination.clone();
        self.step = snapshot.step;
    }

    /// Stores the current state as the baseline for [`CandidateModel::restore`].
    pub fn backup(&mut self) {
        self.backup = Some(Box::new(self.snapshot()));
    }

    /// True when a backup baseline exists.
    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Rolls every mutable field back to the last backup.
    ///
    /// The step counter keeps running; only the physics content reverts.
    pub fn restore(&mut self) -> Result<(), PmError> {
        let Some(snapshot) = self.backup.take() else {
            return Err(PmError::Model(
                ErrorInfo::new("no-backup", "restore called before any backup")
                    .with_context("walker", self.walker_id.to_string()),
            ));
        };
        let step = self.step;
        self.restore_snapshot(&snapshot);
        self.step = step;
        self.backup = Some(snapshot);
        Ok(())
    }

    /// Score of the backup baseline, if any.
    pub fn backup_score(&self) -> Option<f64> {
        self.backup.as_ref().map(|snapshot| snapshot.score)
    }

    /// Deep copy without the backup, suitable for handing to the leaderboard.
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.backup = None;
        copy
    }

    /// Drops the opaque oracle payload.
    pub fn strip_best_combination(&mut self) {
        self.best_combination = None;
    }

    /// Resets the oracle-derived fields before re-scoring.
    pub fn clear_scores(&mut self) {
        self.score = 0.0;
        self.significance = 0.0;
        self.rmax = 0.0;
        self.r2 = 0.0;
        self.muhat = 1.0;
        self.best_combination = None;
    }

    /// Near-equality on masses, decays and relevant multipliers.
    pub fn almost_same_as(&self, other: &CandidateModel) -> bool {
        let mut unfrozen: BTreeSet<ParticleId> = self.unfrozen_particles(true).into_iter().collect();
        let other_unfrozen: BTreeSet<ParticleId> =
            other.unfrozen_particles(true).into_iter().collect();
        if unfrozen != other_unfrozen {
            return false;
        }
        for &pid in &unfrozen {
            let (Some(a), Some(b)) = (self.mass(pid), other.mass(pid)) else {
                return false;
            };
            if !relatively_close(a, b) {
                return false;
            }
        }
        unfrozen.remove(&self.lsp);
        for &mother in &unfrozen {
            let empty = DecayTable::new();
            let mine = self.decays.get(&mother).unwrap_or(&empty);
            let theirs = other.decays.get(&mother).unwrap_or(&empty);
            let channels: BTreeSet<&DaughterSpec> = mine.keys().chain(theirs.keys()).collect();
            for channel in channels {
                let a = mine.get(channel).copied().unwrap_or(0.0);
                let b = theirs.get(channel).copied().unwrap_or(0.0);
                if (a - b).abs() > SAME_TOLERANCE {
                    return false;
                }
            }
        }
        self.relevant_ss_pairs()
            .into_iter()
            .all(|pair| relatively_close(self.ss_multiplier(pair), other.ss_multiplier(pair)))
    }

    /// Raises every unfrozen particle lighter than the LSP to the LSP mass and
    /// repairs the decays that closes. Returns the particles that moved.
    pub fn lift_below_lsp(&mut self, rng: &mut RngHandle) -> Vec<ParticleId> {
        let lsp_mass = self.lsp_mass();
        let lifted: Vec<ParticleId> = self
            .unfrozen_particles(true)
            .into_iter()
            .filter(|&pid| self.mass(pid).is_some_and(|mass| mass < lsp_mass))
            .collect();
        for &pid in &lifted {
            warn!(
                "{pid} at {:?} is lighter than the LSP at {lsp_mass}, raising it",
                self.mass(pid)
            );
            self.masses.insert(pid, lsp_mass);
        }
        if !lifted.is_empty() {
            self.remove_all_offshell_decays(rng);
        }
        lifted
    }

    /// Lists every violated structural invariant; empty for a consistent model.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let lsp_mass = self.lsp_mass();
        if self.is_frozen(self.lsp) {
            violations.push(format!("LSP {} is frozen", self.lsp));
        }
        for pid in self.unfrozen_particles(false) {
            let mass = self.mass(pid).unwrap_or(f64::NAN);
            if mass.is_nan() || mass < lsp_mass {
                violations.push(format!("{pid} at {mass} is lighter than the LSP at {lsp_mass}"));
            }
            let Some(table) = self.decays.get(&pid) else {
                continue;
            };
            if table.values().any(|ratio| !ratio.is_finite() || *ratio < 0.0) {
                violations.push(format!("{pid} has an invalid branching ratio"));
            }
            let total: f64 = table.values().sum();
            let any_open = !self.open_channels(pid).is_empty();
            if any_open && (total - 1.0).abs() > BR_EPSILON {
                violations.push(format!("branchings of {pid} sum to {total}"));
            }
            for (channel, &ratio) in table {
                if ratio > BR_EPSILON && self.is_offshell(pid, channel) {
                    violations.push(format!("{pid} -> {channel} is off-shell with ratio {ratio}"));
                }
            }
        }
        violations
    }

    /// Stable content hash over masses, decays and multipliers (rounded).
    pub fn canonical_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (pid, mass) in &self.masses {
            hasher.update(pid.to_le_bytes());
            hasher.update(round_for_hash(*mass).to_le_bytes());
        }
        for (mother, table) in &self.decays {
            if self.is_frozen(*mother) {
                continue;
            }
            hasher.update(mother.to_le_bytes());
            for (channel, ratio) in table {
                hasher.update(channel.to_string().as_bytes());
                hasher.update(round_for_hash(*ratio).to_le_bytes());
            }
        }
        for (pair, value) in self.relevant_ssmultipliers() {
            hasher.update(pair.to_string().as_bytes());
            hasher.update(round_for_hash(value).to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// One-line summary for logs.
    pub fn describe(&self) -> String {
        format!(
            "K={:.3} Z={:.3} rmax={:.3} unfrozen={} step={}",
            self.score,
            self.significance,
            self.rmax,
            self.unfrozen_particles(true).len(),
            self.step
        )
    }
}

fn relatively_close(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        return true;
    }
    (a - b).abs() <= SAME_TOLERANCE * scale
}

fn round_for_hash(value: f64) -> i64 {
    (value * 1e4).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> CandidateModel {
        let catalog = ParticleCatalog::default();
        let mut model = CandidateModel::minimal(&catalog, 100.0, 0);
        model.masses.insert(1000006, 500.0);
        model
    }

    #[test]
    fn classification_follows_mass_threshold() {
        let model = model();
        assert_eq!(model.unfrozen_particles(true), vec![1000006, 1000022]);
        assert_eq!(model.unfrozen_particles(false), vec![1000006]);
        assert!(model.frozen_particles().contains(&1000021));
        assert!(model.is_frozen(-1000021));
        assert!(!model.is_frozen(-1000006));
    }

    #[test]
    fn normalization_redraws_degenerate_tables() {
        let mut model = model();
        let mut rng = RngHandle::from_seed(3);
        model.normalize_branchings(1000006, false, &mut rng);
        let table = &model.decays[&1000006];
        let total: f64 = table.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(table[&DaughterSpec::new(vec![1000022, 6])] > 0.0);
        assert_eq!(table[&DaughterSpec::new(vec![1000021, 6])], 0.0);
    }

    #[test]
    fn normalization_rescales_multipliers() {
        let mut model = model();
        let mut rng = RngHandle::from_seed(3);
        let table = model.decays.get_mut(&1000006).unwrap();
        table.insert(DaughterSpec::new(vec![1000022, 6]), 0.5);
        let factor = model.normalize_branchings(1000006, true, &mut rng);
        assert!((factor - 0.5).abs() < 1e-12);
        assert!((model.ss_multiplier(PairKey::new(1000006, -1000006)) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn invalid_ratios_are_coerced() {
        let mut model = model();
        let mut rng = RngHandle::from_seed(3);
        let table = model.decays.get_mut(&1000006).unwrap();
        table.insert(DaughterSpec::new(vec![1000022, 6]), f64::NAN);
        table.insert(DaughterSpec::new(vec![1000024, 5]), -3.0);
        model.normalize_branchings(1000006, false, &mut rng);
        assert!(model.invariant_violations().is_empty());
    }
}
