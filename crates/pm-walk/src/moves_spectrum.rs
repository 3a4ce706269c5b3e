use log::debug;
use pm_core::RngHandle;
use pm_model::{CandidateModel, ParticleCatalog, FROZEN_MASS};

use crate::config::StepPolicy;
use crate::mutator::MutationOutcome;

/// Unfreezes a random frozen catalog particle at a mass drawn between the LSP
/// mass and the catalog maximum.
pub fn unfreeze_random(
    model: &mut CandidateModel,
    catalog: &ParticleCatalog,
    rng: &mut RngHandle,
) -> MutationOutcome {
    let frozen: Vec<_> = model
        .frozen_particles()
        .into_iter()
        .filter(|pid| catalog.ids.contains(pid) && *pid != model.lsp)
        .collect();
    let Some(&pid) = rng.pick(&frozen) else {
        return MutationOutcome::Unchanged;
    };
    let mass = rng.uniform(model.lsp_mass(), catalog.max_mass);
    model.masses.insert(pid, mass);
    let table = model.decays.entry(pid).or_default();
    for channel in catalog.template_for(pid) {
        table.entry(channel.clone()).or_insert(0.0);
    }
    model.remove_all_offshell_decays(rng);
    MutationOutcome::Changed(format!("unfreeze:{pid}:{mass:.1}"))
}

/// Freezes a random non-LSP particle while more than two particles are unfrozen.
pub fn freeze_random(model: &mut CandidateModel, rng: &mut RngHandle) -> MutationOutcome {
    if model.unfrozen_particles(true).len() < 3 {
        return MutationOutcome::Unchanged;
    }
    let candidates = model.unfrozen_particles(false);
    let Some(&pid) = rng.pick(&candidates) else {
        return MutationOutcome::Unchanged;
    };
    freeze(model, pid, rng);
    MutationOutcome::Changed(format!("freeze:{pid}"))
}

/// Freezes the heaviest non-LSP particle while more than two particles are unfrozen.
pub fn freeze_most_massive(model: &mut CandidateModel, rng: &mut RngHandle) -> MutationOutcome {
    if model.unfrozen_particles(true).len() < 3 {
        return MutationOutcome::Unchanged;
    }
    let heaviest = model
        .unfrozen_particles(false)
        .into_iter()
        .filter_map(|pid| model.mass(pid).map(|mass| (pid, mass)))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    let Some((pid, _)) = heaviest else {
        return MutationOutcome::Unchanged;
    };
    freeze(model, pid, rng);
    MutationOutcome::Changed(format!("freeze-heaviest:{pid}"))
}

/// Moves the particle to the frozen mass and closes every channel into it.
/// The particle keeps its own branching table for a later unfreeze.
fn freeze(model: &mut CandidateModel, pid: i64, rng: &mut RngHandle) {
    model.masses.insert(pid, FROZEN_MASS);
    model.remove_all_offshell_decays(rng);
}

/// Perturbs one (or every) unfrozen mass by a bounded uniform step.
///
/// The bound shrinks as the score grows. The LSP stays within the catalog
/// window and pushes every state it would overtake just above itself; other
/// states never drop below the LSP.
pub fn random_mass_step(
    model: &mut CandidateModel,
    catalog: &ParticleCatalog,
    policy: &StepPolicy,
    rng: &mut RngHandle,
) -> MutationOutcome {
    let mut targets = model.unfrozen_particles(true);
    if targets.is_empty() {
        return MutationOutcome::Unchanged;
    }
    if policy.single_mass {
        let idx = rng.index(targets.len());
        targets = vec![targets[idx]];
    } else {
        targets.sort_by_key(|pid| *pid != model.lsp);
    }
    let bound = policy.mass_bound(model.score);
    let mut moved = Vec::with_capacity(targets.len());
    for pid in targets {
        let Some(old) = model.mass(pid) else {
            continue;
        };
        let proposed = old + rng.uniform(-bound, bound);
        if pid == model.lsp {
            let mass = proposed.clamp(catalog.min_mass, catalog.max_mass - catalog.min_gap);
            model.masses.insert(pid, mass);
            let floor = (mass + catalog.min_gap).min(catalog.max_mass);
            for other in model.unfrozen_particles(false) {
                if model.mass(other).is_some_and(|m| m < mass) {
                    debug!("lsp move to {mass:.1} pushes {other} up to {floor:.1}");
                    model.masses.insert(other, floor);
                }
            }
            moved.push(format!("{pid}:{mass:.1}"));
        } else {
            let mass = proposed.clamp(model.lsp_mass(), catalog.max_mass);
            model.masses.insert(pid, mass);
            moved.push(format!("{pid}:{mass:.1}"));
        }
    }
    model.remove_all_offshell_decays(rng);
    MutationOutcome::Changed(format!("mass-step:{}", moved.join(",")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_state_model(catalog: &ParticleCatalog) -> CandidateModel {
        let mut model = CandidateModel::minimal(catalog, 300.0, 0);
        model.masses.insert(1000006, 900.0);
        model.masses.insert(1000021, 1500.0);
        let mut rng = RngHandle::from_seed(3);
        model.remove_all_offshell_decays(&mut rng);
        model
    }

    #[test]
    fn freezing_stops_at_two_particles() {
        let catalog = ParticleCatalog::default();
        let mut model = three_state_model(&catalog);
        let mut rng = RngHandle::from_seed(9);
        assert!(freeze_most_massive(&mut model, &mut rng).is_changed());
        assert!(model.is_frozen(1000021));
        assert!(!freeze_random(&mut model, &mut rng).is_changed());
        assert_eq!(model.unfrozen_particles(true).len(), 2);
    }

    #[test]
    fn frozen_particle_keeps_its_table() {
        let catalog = ParticleCatalog::default();
        let mut model = three_state_model(&catalog);
        let before = model.decays[&1000021].clone();
        let mut rng = RngHandle::from_seed(2);
        freeze_most_massive(&mut model, &mut rng);
        assert_eq!(model.decays[&1000021], before);
        assert!(model.invariant_violations().is_empty());
    }

    #[test]
    fn lsp_move_pushes_lighter_states_up() {
        let catalog = ParticleCatalog::default();
        let mut model = three_state_model(&catalog);
        let policy = StepPolicy {
            mass_step: 2000.0,
            single_mass: false,
            ..StepPolicy::default()
        };
        for seed in 0..32 {
            let mut rng = RngHandle::from_seed(seed);
            random_mass_step(&mut model, &catalog, &policy, &mut rng);
            let lsp = model.lsp_mass();
            for pid in model.unfrozen_particles(false) {
                assert!(model.mass(pid).unwrap() >= lsp);
            }
            assert!(model.invariant_violations().is_empty(), "seed {seed}");
        }
    }
}
