use pm_core::RngHandle;
use pm_model::{CandidateModel, PairKey, ParticleCatalog};
use pm_walk::moves_couplings::{change_branchings, change_ssms};
use pm_walk::moves_spectrum::{freeze_most_massive, freeze_random, random_mass_step, unfreeze_random};
use pm_walk::moves_structure::{attempt_merger, check_swaps, swap_particles};
use pm_walk::{Mutator, ScoreOracle, StepPolicy, SyntheticOracle, SyntheticOracleConfig};
use proptest::prelude::*;

fn busy_policy() -> StepPolicy {
    let mut policy = StepPolicy::default();
    policy.ssm_zero = 0.2;
    policy.ssm_copy = 0.2;
    policy.branching_snap_zero = 0.3;
    policy
}

fn populated_model(catalog: &ParticleCatalog, rng: &mut RngHandle, extra: usize) -> CandidateModel {
    let mut model = CandidateModel::minimal(catalog, rng.uniform(100.0, 600.0), 0);
    for _ in 0..extra {
        unfreeze_random(&mut model, catalog, rng);
    }
    model
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn operator_sequences_keep_models_consistent(
        seed in any::<u64>(),
        extra in 0usize..6,
        ops in prop::collection::vec(0usize..9, 1..40),
    ) {
        let catalog = ParticleCatalog::default();
        let policy = busy_policy();
        let mut oracle = SyntheticOracle::new(SyntheticOracleConfig::default());
        let mut rng = RngHandle::from_seed(seed);
        let mut model = populated_model(&catalog, &mut rng, extra);
        oracle.evaluate(&mut model).unwrap();
        prop_assert!(model.invariant_violations().is_empty());

        for op in ops {
            match op {
                0 => {
                    unfreeze_random(&mut model, &catalog, &mut rng);
                }
                1 => {
                    freeze_random(&mut model, &mut rng);
                }
                2 => {
                    freeze_most_massive(&mut model, &mut rng);
                }
                3 => {
                    change_branchings(&mut model, &policy, &mut rng);
                }
                4 => {
                    change_ssms(&mut model, &policy, &mut rng);
                }
                5 => {
                    random_mass_step(&mut model, &catalog, &policy, &mut rng);
                }
                6 => {
                    attempt_merger(&mut model, &catalog, &policy, &mut oracle, &mut rng).unwrap();
                }
                7 => {
                    check_swaps(&mut model, &catalog, Some(&mut oracle), &mut rng).unwrap();
                }
                _ => {
                    check_swaps(&mut model, &catalog, None, &mut rng).unwrap();
                }
            }
            let violations = model.invariant_violations();
            prop_assert!(violations.is_empty(), "after op {}: {:?}", op, violations);
            prop_assert!(model
                .ssmultipliers
                .values()
                .all(|value| value.is_finite() && *value >= 0.0));
        }
    }

    #[test]
    fn proposals_keep_models_consistent(seed in any::<u64>(), steps in 1usize..25) {
        let catalog = ParticleCatalog::default();
        let mutator = Mutator::new(catalog.clone(), busy_policy());
        let mut oracle = SyntheticOracle::new(SyntheticOracleConfig::default());
        let mut rng = RngHandle::from_seed(seed);
        let mut model = populated_model(&catalog, &mut rng, 2);
        for _ in 0..steps {
            oracle.evaluate(&mut model).unwrap();
            let proposal = mutator.propose(&mut model, &mut oracle, &mut rng).unwrap();
            prop_assert!(proposal.changed() || model.unfrozen_particles(true).is_empty());
            let violations = model.invariant_violations();
            prop_assert!(violations.is_empty(), "{:?}: {:?}", proposal.describe(), violations);
        }
    }

    #[test]
    fn swapping_twice_is_the_identity(
        seed in any::<u64>(),
        light in 200.0f64..2000.0,
        heavy in 200.0f64..2000.0,
        factor in 0.1f64..3.0,
    ) {
        let catalog = ParticleCatalog::default();
        let mut rng = RngHandle::from_seed(seed);
        let mut model = CandidateModel::minimal(&catalog, 150.0, 0);
        model.masses.insert(1000005, light);
        model.masses.insert(2000005, heavy);
        model.masses.insert(1000006, 1200.0);
        model.remove_all_offshell_decays(&mut rng);
        model.ssmultipliers.insert(PairKey::new(1000005, -1000005), factor);
        model.ssmultipliers.insert(PairKey::new(1000005, 2000005), factor * 0.5);
        model.ssmultipliers.insert(PairKey::new(2000005, -1000006), factor * 2.0);
        let original = model.clone();

        prop_assert!(swap_particles(&mut model, 1000005, 2000005).is_changed());
        prop_assert_eq!(model.mass(1000005), Some(heavy));
        prop_assert_eq!(model.mass(2000005), Some(light));
        prop_assert!(model.invariant_violations().is_empty());
        swap_particles(&mut model, 2000005, 1000005);
        prop_assert_eq!(&model, &original);
    }
}

#[test]
fn lsp_is_never_swapped() {
    let catalog = ParticleCatalog::default();
    let mut model = CandidateModel::minimal(&catalog, 150.0, 0);
    let before = model.clone();
    assert!(!swap_particles(&mut model, catalog.lsp, 1000005).is_changed());
    assert!(!swap_particles(&mut model, 1000005, 1000005).is_changed());
    assert!(!swap_particles(&mut model, 1000005, 9999999).is_changed());
    assert_eq!(model, before);
}
