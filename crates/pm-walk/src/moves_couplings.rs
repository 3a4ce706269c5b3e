use log::warn;
use pm_core::RngHandle;
use pm_model::CandidateModel;
use rand_distr::{Distribution, Normal};

use crate::config::StepPolicy;
use crate::mutator::MutationOutcome;

/// Perturbs the open channels of a random particle with at least two of them.
///
/// Every open ratio moves by a bounded uniform amount; occasionally one
/// channel snaps to zero or copies another. The table is renormalized
/// afterwards and closed channels are never touched.
pub fn change_branchings(
    model: &mut CandidateModel,
    policy: &StepPolicy,
    rng: &mut RngHandle,
) -> MutationOutcome {
    let candidates: Vec<_> = model
        .unfrozen_particles(false)
        .into_iter()
        .filter(|&pid| model.open_channels(pid).len() >= 2)
        .collect();
    let Some(&pid) = rng.pick(&candidates) else {
        return MutationOutcome::Unchanged;
    };
    let open = model.open_channels(pid);
    let Some(table) = model.decays.get_mut(&pid) else {
        return MutationOutcome::Unchanged;
    };
    for channel in &open {
        let delta = rng.uniform(-policy.branching_step, policy.branching_step);
        let ratio = table.entry(channel.clone()).or_insert(0.0);
        *ratio = (*ratio + delta).max(0.0);
    }
    let mut detail = String::new();
    if rng.chance(policy.branching_snap_zero) {
        if let Some(channel) = rng.pick(&open) {
            table.insert(channel.clone(), 0.0);
            detail = format!(":zero {channel}");
        }
    }
    if rng.chance(policy.branching_copy) {
        let from = rng.index(open.len());
        let to = rng.index(open.len());
        if from != to {
            let value = table.get(&open[from]).copied().unwrap_or(0.0);
            table.insert(open[to].clone(), value);
            detail = format!("{detail}:copy {}->{}", open[from], open[to]);
        }
    }
    model.normalize_branchings(pid, false, rng);
    MutationOutcome::Changed(format!("branchings:{pid}{detail}"))
}

/// Perturbs signal-strength multipliers.
///
/// Either every pair containing one random particle is scaled by a common
/// factor, or a single random pair is scaled by a Gaussian factor around one.
/// Occasionally a multiplier is zeroed, reset to one or copied from another.
pub fn change_ssms(
    model: &mut CandidateModel,
    policy: &StepPolicy,
    rng: &mut RngHandle,
) -> MutationOutcome {
    let active = model.unfrozen_particles(false);
    if active.len() < 2 {
        return MutationOutcome::Unchanged;
    }
    let pairs = model.relevant_ss_pairs();
    let description = if rng.chance(policy.ssm_single_particle) {
        let Some(&pid) = rng.pick(&active) else {
            return MutationOutcome::Unchanged;
        };
        let factor = rng.uniform(1.0 - policy.ssm_factor_width, 1.0 + policy.ssm_factor_width);
        for pair in pairs.iter().filter(|pair| pair.occurrences(pid) > 0) {
            let current = model.ss_multiplier(*pair);
            model.ssmultipliers.insert(*pair, current * factor);
        }
        format!("ssm:{pid}*{factor:.3}")
    } else {
        let Some(&pair) = rng.pick(&pairs) else {
            return MutationOutcome::Unchanged;
        };
        let factor = match Normal::new(1.0, policy.ssm_sigma) {
            Ok(normal) => normal.sample(rng).abs(),
            Err(err) => {
                warn!("invalid ssm sigma {}: {err}", policy.ssm_sigma);
                1.0
            }
        };
        let current = model.ss_multiplier(pair);
        model.ssmultipliers.insert(pair, current * factor);
        format!("ssm:({pair})*{factor:.3}")
    };
    if rng.chance(policy.ssm_zero) {
        if let Some(&pair) = rng.pick(&pairs) {
            model.ssmultipliers.insert(pair, 0.0);
        }
    }
    if rng.chance(policy.ssm_reset) {
        if let Some(&pair) = rng.pick(&pairs) {
            model.ssmultipliers.insert(pair, 1.0);
        }
    }
    if rng.chance(policy.ssm_copy) {
        if let (Some(&from), Some(&to)) = (rng.pick(&pairs), rng.pick(&pairs)) {
            let value = model.ss_multiplier(from);
            model.ssmultipliers.insert(to, value);
        }
    }
    for value in model.ssmultipliers.values_mut() {
        if !value.is_finite() || *value < 0.0 {
            *value = 1.0;
        }
    }
    MutationOutcome::Changed(description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_model::{PairKey, ParticleCatalog};

    fn model_with_gluino() -> CandidateModel {
        let catalog = ParticleCatalog::default();
        let mut model = CandidateModel::minimal(&catalog, 100.0, 0);
        model.masses.insert(1000006, 800.0);
        model.masses.insert(1000021, 1600.0);
        let mut rng = RngHandle::from_seed(5);
        model.remove_all_offshell_decays(&mut rng);
        model
    }

    #[test]
    fn closed_channels_stay_closed() {
        let mut model = model_with_gluino();
        let policy = StepPolicy::default();
        for seed in 0..50 {
            let mut rng = RngHandle::from_seed(seed);
            change_branchings(&mut model, &policy, &mut rng);
            assert!(model.invariant_violations().is_empty(), "seed {seed}");
        }
        let closed = model.decays[&1000021]
            .iter()
            .filter(|(channel, _)| model.is_offshell(1000021, channel))
            .all(|(_, ratio)| *ratio == 0.0);
        assert!(closed);
    }

    #[test]
    fn ssm_needs_two_active_particles() {
        let catalog = ParticleCatalog::default();
        let mut model = CandidateModel::minimal(&catalog, 100.0, 0);
        model.masses.insert(1000006, 800.0);
        let mut rng = RngHandle::from_seed(1);
        assert!(!change_ssms(&mut model, &StepPolicy::default(), &mut rng).is_changed());
    }

    #[test]
    fn ssm_stay_non_negative() {
        let mut model = model_with_gluino();
        let policy = StepPolicy {
            ssm_zero: 0.5,
            ssm_copy: 0.5,
            ..StepPolicy::default()
        };
        for seed in 0..50 {
            let mut rng = RngHandle::from_seed(seed);
            assert!(change_ssms(&mut model, &policy, &mut rng).is_changed());
        }
        assert!(model.ssmultipliers.values().all(|v| v.is_finite() && *v >= 0.0));
        assert!(model.ss_multiplier(PairKey::new(1000006, 1000021)) >= 0.0);
    }
}
