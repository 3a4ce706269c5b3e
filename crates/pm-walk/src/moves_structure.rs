use std::collections::BTreeMap;

use log::{debug, info, warn};
use pm_core::errors::PmError;
use pm_core::RngHandle;
use pm_model::{CandidateModel, DecayTable, PairKey, ParticleCatalog, ParticleId, FROZEN_MASS};

use crate::config::StepPolicy;
use crate::mutator::MutationOutcome;
use crate::oracle::ScoreOracle;

/// Closest unfrozen pair within one mergeable group whose gap is below the
/// catalog threshold. The lighter particle comes first.
pub fn merge_candidate(
    model: &CandidateModel,
    catalog: &ParticleCatalog,
) -> Option<(ParticleId, ParticleId)> {
    let mut best: Option<(f64, ParticleId, ParticleId)> = None;
    for group in &catalog.mergeable {
        let members: Vec<(ParticleId, f64)> = group
            .iter()
            .filter(|&&pid| pid != model.lsp && !model.is_frozen(pid))
            .filter_map(|&pid| model.mass(pid).map(|mass| (pid, mass)))
            .collect();
        for (idx, &(a, ma)) in members.iter().enumerate() {
            for &(b, mb) in &members[idx + 1..] {
                let gap = (ma - mb).abs();
                if gap >= catalog.merge_threshold {
                    continue;
                }
                if best.map_or(true, |(current, _, _)| gap < current) {
                    let (light, heavy) = if ma <= mb { (a, b) } else { (b, a) };
                    best = Some((gap, light, heavy));
                }
            }
        }
    }
    best.map(|(_, light, heavy)| (light, heavy))
}

/// Merges `drop` into `keep`.
///
/// The surviving state sits at the average mass, inherits the decays of the
/// dropped state, every channel into the dropped state is redirected to the
/// survivor and the production multipliers of the pairs collapsing onto each
/// other are summed. The dropped state is frozen.
pub fn merge_pair(
    model: &mut CandidateModel,
    keep: ParticleId,
    drop: ParticleId,
    rng: &mut RngHandle,
) {
    let (Some(mk), Some(md)) = (model.mass(keep), model.mass(drop)) else {
        warn!("cannot merge {drop} into {keep}: unknown particle");
        return;
    };
    model.masses.insert(keep, 0.5 * (mk + md));

    let inherited = model.decays.get(&drop).cloned().unwrap_or_default();
    for table in model.decays.values_mut() {
        let moved: Vec<_> = table
            .iter()
            .filter(|(channel, _)| channel.involves(drop))
            .map(|(channel, ratio)| (channel.clone(), *ratio))
            .collect();
        for (channel, ratio) in moved {
            table.remove(&channel);
            *table.entry(channel.renamed(drop, keep)).or_insert(0.0) += ratio;
        }
    }
    let survivor: &mut DecayTable = model.decays.entry(keep).or_default();
    for (channel, ratio) in inherited {
        let channel = channel.renamed(drop, keep);
        if channel.involves(keep) {
            continue;
        }
        *survivor.entry(channel).or_insert(0.0) += ratio;
    }

    let mut merged: BTreeMap<PairKey, f64> = BTreeMap::new();
    for pair in model.relevant_ss_pairs() {
        let target = pair.renamed(drop, keep);
        *merged.entry(target).or_insert(0.0) += model.ss_multiplier(pair);
    }
    model
        .ssmultipliers
        .retain(|pair, _| pair.occurrences(drop) == 0);
    for (pair, value) in merged {
        model.ssmultipliers.insert(pair, value);
    }

    model.masses.insert(drop, FROZEN_MASS);
    model.normalize_branchings(keep, false, rng);
    model.remove_all_offshell_decays(rng);
}

/// Merges the closest mergeable pair and keeps the merger only when the
/// re-scored model neither regresses nor becomes excluded.
///
/// The model is rolled back through a local snapshot so the walker's own
/// backup baseline is untouched. On success the score fields are current.
pub fn attempt_merger(
    model: &mut CandidateModel,
    catalog: &ParticleCatalog,
    policy: &StepPolicy,
    oracle: &mut dyn ScoreOracle,
    rng: &mut RngHandle,
) -> Result<MutationOutcome, PmError> {
    let Some((keep, drop)) = merge_candidate(model, catalog) else {
        return Ok(MutationOutcome::Unchanged);
    };
    let before = model.snapshot();
    let old_score = model.score;
    merge_pair(model, keep, drop, rng);
    let merit = match oracle.evaluate(model) {
        Ok(merit) => merit,
        Err(err) => {
            model.restore_snapshot(&before);
            return Err(err);
        }
    };
    let excluded = merit.excluded || model.rmax > policy.exclusion_threshold;
    if excluded || model.score < policy.merge_regression * old_score {
        debug!(
            "reverting merger of {drop} into {keep}: score {:.3} vs {old_score:.3}, excluded {excluded}",
            model.score
        );
        model.restore_snapshot(&before);
        return Ok(MutationOutcome::Unchanged);
    }
    info!("merged {drop} into {keep}, score {:.3}", model.score);
    Ok(MutationOutcome::Changed(format!("merge:{drop}->{keep}")))
}

/// Exchanges every reference to `a` and `b`: masses, decay tables as mother,
/// channels as daughter and multiplier keys. Applying it twice is the identity.
pub fn swap_particles(model: &mut CandidateModel, a: ParticleId, b: ParticleId) -> MutationOutcome {
    let (a, b) = (a.abs(), b.abs());
    if a == b || a == model.lsp || b == model.lsp {
        return MutationOutcome::Unchanged;
    }
    let (Some(ma), Some(mb)) = (model.mass(a), model.mass(b)) else {
        warn!("skipping swap of {a} and {b}: particle missing from the model");
        return MutationOutcome::Unchanged;
    };
    model.masses.insert(a, mb);
    model.masses.insert(b, ma);

    let table_a = model.decays.remove(&a);
    let table_b = model.decays.remove(&b);
    if let Some(table) = table_a {
        model.decays.insert(b, table);
    }
    if let Some(table) = table_b {
        model.decays.insert(a, table);
    }
    for table in model.decays.values_mut() {
        *table = table
            .iter()
            .map(|(channel, ratio)| (channel.swapped(a, b), *ratio))
            .collect();
    }
    model.ssmultipliers = model
        .ssmultipliers
        .iter()
        .map(|(pair, value)| (pair.swapped(a, b), *value))
        .collect();
    MutationOutcome::Changed(format!("swap:{a}<->{b}"))
}

/// Restores the naming convention of every ordered pair whose heavier id is
/// currently the lighter state.
///
/// With an oracle, swaps of disambiguated pairs are re-scored and reverted
/// when the score drops or the exclusion ratio grows. Without one (the cheap
/// periodic pass) those pairs are left alone.
pub fn check_swaps(
    model: &mut CandidateModel,
    catalog: &ParticleCatalog,
    mut oracle: Option<&mut dyn ScoreOracle>,
    rng: &mut RngHandle,
) -> Result<MutationOutcome, PmError> {
    let mut swapped = Vec::new();
    for &(light, heavy) in &catalog.ordered_pairs {
        let (Some(ml), Some(mh)) = (model.mass(light), model.mass(heavy)) else {
            continue;
        };
        if mh >= ml {
            continue;
        }
        if !catalog.is_disambiguated(light, heavy) {
            if swap_particles(model, light, heavy).is_changed() {
                swapped.push(format!("{light}<->{heavy}"));
            }
            continue;
        }
        let Some(oracle) = oracle.as_deref_mut() else {
            continue;
        };
        let before = model.snapshot();
        let (old_score, old_rmax) = (model.score, model.rmax);
        swap_particles(model, light, heavy);
        model.remove_all_offshell_decays(rng);
        if let Err(err) = oracle.evaluate(model) {
            model.restore_snapshot(&before);
            return Err(err);
        }
        if model.score < old_score || model.rmax > old_rmax {
            debug!("reverting swap of {light} and {heavy}");
            model.restore_snapshot(&before);
        } else {
            swapped.push(format!("{light}<->{heavy}"));
        }
    }
    if swapped.is_empty() {
        Ok(MutationOutcome::Unchanged)
    } else {
        Ok(MutationOutcome::Changed(format!("swap:{}", swapped.join(","))))
    }
}
