use std::fs;

use pm_model::{load_state_dicts, CandidateModel, ParticleCatalog};
use pm_walk::hiscore::{insert_candidate, CutoffFile, Insertion};
use pm_walk::lock::LockFile;
use pm_walk::{compile_hiscores, ConsiderOutcome, HiscoreConfig, HiscorePaths, HiscoreRecord, Hiscores};
use proptest::prelude::*;
use tempfile::tempdir;

fn ranked_model(lsp_mass: f64, score: f64) -> CandidateModel {
    let catalog = ParticleCatalog::default();
    let mut model = CandidateModel::minimal(&catalog, lsp_mass, 0);
    model.score = score;
    model
}

fn scores(slots: &[Option<CandidateModel>]) -> Vec<Option<f64>> {
    slots
        .iter()
        .map(|slot| slot.as_ref().map(|model| model.score))
        .collect()
}

fn fast_config(capacity: usize) -> HiscoreConfig {
    HiscoreConfig {
        capacity,
        max_retries: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 4,
        ..HiscoreConfig::default()
    }
}

#[test]
fn better_candidate_demotes_the_tail() {
    let mut slots = vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 7.0)), None];
    let outcome = insert_candidate(&mut slots, 3, &ranked_model(300.0, 8.0));
    assert_eq!(outcome, Insertion::Inserted(1));
    assert_eq!(scores(&slots), vec![Some(10.0), Some(8.0), Some(7.0)]);
}

#[test]
fn candidate_fills_the_first_empty_slot() {
    let mut slots = vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 7.0)), None];
    let outcome = insert_candidate(&mut slots, 3, &ranked_model(300.0, 5.0));
    assert_eq!(outcome, Insertion::Inserted(2));
    assert_eq!(scores(&slots), vec![Some(10.0), Some(7.0), Some(5.0)]);
}

#[test]
fn near_duplicate_is_not_admitted() {
    let mut slots = vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 7.0)), None];
    let twin = ranked_model(200.0 * (1.0 + 1e-7), 9.0);
    assert_eq!(insert_candidate(&mut slots, 3, &twin), Insertion::Duplicate(1));
    assert_eq!(scores(&slots), vec![Some(10.0), Some(7.0), None]);
}

#[test]
fn full_board_rejects_weaker_candidates() {
    let mut slots = vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 7.0))];
    assert_eq!(
        insert_candidate(&mut slots, 2, &ranked_model(300.0, 7.0)),
        Insertion::NotBetter
    );
    assert_eq!(scores(&slots), vec![Some(10.0), Some(7.0)]);
}

#[test]
fn two_views_merge_through_the_record() {
    let dir = tempdir().unwrap();
    let paths = HiscorePaths::for_record(&dir.path().join("hiscores.bin"));
    let mut first = Hiscores::persistent(fast_config(3), paths.clone());
    let mut second = Hiscores::persistent(fast_config(3), paths.clone());
    second.refresh().unwrap();

    assert_eq!(
        first.consider(&ranked_model(100.0, 8.0)).unwrap(),
        ConsiderOutcome::Inserted { rank: 0 }
    );
    assert_eq!(
        second.consider(&ranked_model(200.0, 9.0)).unwrap(),
        ConsiderOutcome::Inserted { rank: 0 }
    );

    let record = HiscoreRecord::load(&paths.record).unwrap();
    assert_eq!(scores(&record.slots), vec![Some(9.0), Some(8.0), None]);
    assert_eq!(record.generation, 2);
    assert!(paths.backup().exists());
    assert!(LockFile::try_acquire(&paths.lock).unwrap().is_some());

    let side = CutoffFile::load(&paths.cutoff).unwrap();
    assert_eq!(side.best, 9.0);
    assert_eq!(side.cutoff, 0.0);
    let states = load_state_dicts(&paths.states).unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].score, 9.0);
}

#[test]
fn side_file_cutoff_filters_before_loading() {
    let dir = tempdir().unwrap();
    let paths = HiscorePaths::for_record(&dir.path().join("hiscores.bin"));
    let mut writer = Hiscores::persistent(fast_config(3), paths.clone());
    for (mass, score) in [(100.0, 10.0), (200.0, 8.0), (300.0, 7.0)] {
        writer.consider(&ranked_model(mass, score)).unwrap();
    }
    let mut late = Hiscores::persistent(fast_config(3), paths.clone());
    assert_eq!(late.global_cutoff(), 7.0);
    assert_eq!(late.global_best(), 10.0);
    assert_eq!(
        late.consider(&ranked_model(400.0, 6.0)).unwrap(),
        ConsiderOutcome::BelowCutoff
    );
    assert_eq!(
        late.consider(&ranked_model(500.0, -1.0)).unwrap(),
        ConsiderOutcome::BelowCutoff
    );
    assert!(late.is_empty());
}

#[test]
fn only_the_top_slot_keeps_its_combination() {
    let dir = tempdir().unwrap();
    let paths = HiscorePaths::for_record(&dir.path().join("hiscores.bin"));
    let mut board = Hiscores::persistent(fast_config(3), paths.clone());
    for (mass, score) in [(100.0, 4.0), (200.0, 6.0)] {
        let mut model = ranked_model(mass, score);
        model.best_combination = Some(pm_model::BestCombination::from_value(
            &serde_json::json!({"analyses": ["a", "b"]}),
        ));
        board.consider(&model).unwrap();
    }
    let record = HiscoreRecord::load(&paths.record).unwrap();
    let top = record.slots[0].as_ref().unwrap();
    let second = record.slots[1].as_ref().unwrap();
    assert!(top.best_combination.is_some());
    assert!(second.best_combination.is_none());
}

#[test]
fn corrupt_record_falls_back_to_an_empty_board() {
    let dir = tempdir().unwrap();
    let paths = HiscorePaths::for_record(&dir.path().join("hiscores.bin"));
    fs::write(&paths.record, b"definitely not bincode").unwrap();
    let mut board = Hiscores::persistent(fast_config(2), paths.clone());
    assert_eq!(
        board.consider(&ranked_model(100.0, 3.0)).unwrap(),
        ConsiderOutcome::Inserted { rank: 0 }
    );
    let record = HiscoreRecord::load(&paths.record).unwrap();
    assert_eq!(scores(&record.slots), vec![Some(3.0), None]);
}

#[test]
fn compile_merges_and_deduplicates() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("a.bin");
    let second = dir.path().join("b.bin");
    let mut board_a = Hiscores::persistent(fast_config(3), HiscorePaths::for_record(&first));
    board_a
        .overwrite(vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 5.0))])
        .unwrap();
    let mut board_b = Hiscores::persistent(fast_config(3), HiscorePaths::for_record(&second));
    board_b
        .overwrite(vec![Some(ranked_model(200.0, 6.0)), Some(ranked_model(300.0, 4.0))])
        .unwrap();

    let missing = dir.path().join("missing.bin");
    let slots = compile_hiscores(&[first, second, missing.clone()], 3).unwrap();
    assert_eq!(scores(&slots), vec![Some(10.0), Some(6.0), Some(4.0)]);

    let err = compile_hiscores(&[missing], 3).unwrap_err();
    assert_eq!(err.code(), "no-inputs");
}

#[test]
fn tied_score_is_not_admitted_into_an_empty_slot() {
    let mut slots = vec![Some(ranked_model(100.0, 10.0)), Some(ranked_model(200.0, 7.0)), None];
    let tie = ranked_model(300.0, 7.0);
    assert_eq!(insert_candidate(&mut slots, 3, &tie), Insertion::NotBetter);
    assert_eq!(scores(&slots), vec![Some(10.0), Some(7.0), None]);

    let mut board = Hiscores::in_memory(fast_config(3));
    board.consider(&ranked_model(100.0, 10.0)).unwrap();
    board.consider(&ranked_model(200.0, 7.0)).unwrap();
    assert_eq!(board.consider(&tie).unwrap(), ConsiderOutcome::BelowCutoff);
    assert_eq!(board.len(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn consider_keeps_the_board_ranked_and_distinct(
        capacity in 1usize..6,
        offers in prop::collection::vec((0usize..8, any::<bool>(), 1u8..10), 1..40),
    ) {
        let mut board = Hiscores::in_memory(fast_config(capacity));
        for (mass_index, jitter, score) in offers {
            let mut lsp_mass = 100.0 + 50.0 * mass_index as f64;
            if jitter {
                lsp_mass *= 1.0 + 1e-7;
            }
            board.consider(&ranked_model(lsp_mass, f64::from(score))).unwrap();

            let slots = board.slots();
            prop_assert!(slots.len() <= capacity);
            let listed: Vec<&CandidateModel> = slots.iter().flatten().collect();
            prop_assert!(listed.len() <= capacity);
            for pair in listed.windows(2) {
                prop_assert!(pair[0].score > pair[1].score, "{:?}", scores(slots));
            }
            for (i, a) in listed.iter().enumerate() {
                for b in &listed[i + 1..] {
                    prop_assert!(!a.almost_same_as(b) && !b.almost_same_as(a));
                }
            }
            let filled = slots.iter().take_while(|slot| slot.is_some()).count();
            prop_assert_eq!(filled, listed.len());
        }
    }
}
