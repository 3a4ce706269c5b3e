use pm_core::RngHandle;
use pm_model::{CandidateModel, DaughterSpec, PairKey, ParticleCatalog, FROZEN_MASS};
use proptest::prelude::*;

fn sample_model() -> CandidateModel {
    let catalog = ParticleCatalog::default();
    let mut model = CandidateModel::minimal(&catalog, 150.0, 2);
    model.masses.insert(1000006, 700.0);
    model.masses.insert(1000021, 1400.0);
    let mut rng = RngHandle::from_seed(11);
    model.remove_all_offshell_decays(&mut rng);
    model.ssmultipliers.insert(PairKey::new(1000021, 1000021), 0.7);
    model.score = 3.5;
    model
}

#[test]
fn restore_without_backup_fails() {
    let mut model = sample_model();
    let err = model.restore().unwrap_err();
    assert_eq!(err.code(), "no-backup");
}

#[test]
fn restore_reverts_every_mutable_field() {
    let mut model = sample_model();
    model.backup();
    let before = model.snapshot();

    model.masses.insert(1000006, 900.0);
    model.masses.insert(1000005, 400.0);
    model
        .decays
        .get_mut(&1000021)
        .unwrap()
        .insert(DaughterSpec::new(vec![1000006, 6]), 0.9);
    model.ssmultipliers.insert(PairKey::new(1000006, -1000006), 0.1);
    model.score = 9.0;
    model.step = 17;

    model.restore().unwrap();
    let mut expected = before.clone();
    assert_eq!(model.step, 17);
    model.step = 0;
    assert_eq!(model.snapshot(), expected);
    // a second restore from the same baseline is a no-op
    model.restore().unwrap();
    model.step = 0;
    expected = model.snapshot();
    assert_eq!(expected, before);
}

#[test]
fn almost_same_tolerates_tiny_drift_only() {
    let model = sample_model();
    let mut drifted = model.clone();
    *drifted.masses.get_mut(&1000006).unwrap() *= 1.0 + 1e-7;
    assert!(model.almost_same_as(&drifted));

    *drifted.masses.get_mut(&1000006).unwrap() *= 1.0 + 1e-3;
    assert!(!model.almost_same_as(&drifted));

    let mut frozen_extra = model.clone();
    frozen_extra.masses.insert(1000005, 800.0);
    assert!(!model.almost_same_as(&frozen_extra));

    // multipliers of frozen pairs are irrelevant
    let mut irrelevant = model.clone();
    irrelevant
        .ssmultipliers
        .insert(PairKey::new(1000005, 1000005), 0.0);
    assert!(model.almost_same_as(&irrelevant));
}

#[test]
fn state_dict_roundtrip_preserves_content() {
    let catalog = ParticleCatalog::default();
    let model = sample_model();
    let dict = pm_model::StateDict::from_model(&model);
    assert_eq!(dict.masses.len(), 3);
    let json = pm_model::state_dicts_to_json(&[dict.clone()]).unwrap();
    let parsed: Vec<pm_model::StateDict> = serde_json::from_str(&json).unwrap();
    let rebuilt = parsed[0].to_model(&catalog, 2).unwrap();
    assert!(model.almost_same_as(&rebuilt));
    assert_eq!(rebuilt.mass(1000005), Some(FROZEN_MASS));
    assert!(rebuilt.invariant_violations().is_empty());
}

#[test]
fn state_dict_requires_lsp() {
    let catalog = ParticleCatalog::default();
    let mut dict = pm_model::StateDict::from_model(&sample_model());
    dict.masses.remove(&catalog.lsp);
    assert_eq!(dict.to_model(&catalog, 0).unwrap_err().code(), "missing-lsp");
}

#[test]
fn models_survive_binary_and_json_encoding() {
    let mut model = sample_model();
    model.best_combination = Some(pm_model::BestCombination::from_value(
        &serde_json::json!({"analyses": ["A", "B"]}),
    ));
    let bytes = bincode::serialize(&model).unwrap();
    let decoded: CandidateModel = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, model);

    let json = serde_json::to_string(&model).unwrap();
    let decoded: CandidateModel = serde_json::from_str(&json).unwrap();
    assert!(decoded.almost_same_as(&model));
    assert_eq!(decoded.best_combination, model.best_combination);
}

proptest! {
    #[test]
    fn normalization_keeps_production_times_branching(factor in 0.05f64..20.0, seed in any::<u64>()) {
        let mut model = sample_model();
        let pair = PairKey::new(1000006, -1000006);
        model.ssmultipliers.insert(pair, 1.0);
        for ratio in model.decays.get_mut(&1000006).unwrap().values_mut() {
            *ratio *= factor;
        }
        let mut rng = RngHandle::from_seed(seed);
        let total = model.normalize_branchings(1000006, true, &mut rng);

        prop_assert!((total - factor).abs() < 1e-9 * factor.max(1.0));
        let sum: f64 = model.decays[&1000006].values().sum();
        prop_assert!((sum - 1.0).abs() < 1e-9);
        let rescaled = model.ssmultipliers[&pair];
        prop_assert!((rescaled - factor * factor).abs() < 1e-9 * (factor * factor).max(1.0));
        prop_assert!(model.invariant_violations().is_empty());
    }
}
