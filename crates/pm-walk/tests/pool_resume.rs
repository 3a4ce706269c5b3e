use std::fs;
use std::path::Path;

use pm_model::{state_dicts_to_json, CandidateModel, ParticleCatalog, StateDict};
use pm_walk::checkpoint::checkpoint_path;
use pm_walk::pool::report_path;
use pm_walk::{run_pool, run_walker, PoolOptions, RunConfig, WalkerCheckpoint, WalkerStatus};
use pm_core::RngHandle;
use tempfile::tempdir;

fn run_config(root: &Path, steps: u64) -> RunConfig {
    let mut config = RunConfig {
        max_steps: Some(steps),
        ..RunConfig::default()
    };
    config.output.run_directory = Some(root.to_path_buf());
    config.policy.teleport_probability = 0.0;
    config.hiscore.base_backoff_ms = 1;
    config.hiscore.max_backoff_ms = 8;
    config
}

#[test]
fn resumed_walker_matches_uninterrupted_run() {
    let straight = tempdir().unwrap();
    let split = tempdir().unwrap();

    let report = run_walker(&run_config(straight.path(), 24), 0, false).unwrap();
    assert_eq!(report.steps_completed, 24);

    let halfway = run_walker(&run_config(split.path(), 12), 0, false).unwrap();
    assert_eq!(halfway.steps_completed, 12);
    let resumed = run_walker(&run_config(split.path(), 24), 0, true).unwrap();
    assert_eq!(resumed.steps_completed, 24);
    assert_eq!(resumed.stats, report.stats);
    assert_eq!(resumed.best_score, report.best_score);

    let a = WalkerCheckpoint::load(&checkpoint_path(&straight.path().join("walker0"))).unwrap();
    let b = WalkerCheckpoint::load(&checkpoint_path(&split.path().join("walker0"))).unwrap();
    assert_eq!(a.step, 24);
    assert_eq!(a.model, b.model);
}

#[test]
fn checkpoints_follow_the_interval() {
    let dir = tempdir().unwrap();
    let mut config = run_config(dir.path(), 7);
    config.checkpoint.interval = 3;
    run_walker(&config, 1, false).unwrap();
    let checkpoint = WalkerCheckpoint::load(&checkpoint_path(&dir.path().join("walker1"))).unwrap();
    assert_eq!(checkpoint.step, 7);
    assert_eq!(checkpoint.walker_id, 1);
    assert!(checkpoint.model.invariant_violations().is_empty());
    assert!(dir.path().join("walker1.log").exists());
}

#[test]
fn a_dying_walker_does_not_stop_the_pool() {
    let dir = tempdir().unwrap();
    let catalog = ParticleCatalog::default();
    let mut model = CandidateModel::minimal(&catalog, 250.0, 0);
    model.masses.insert(1000006, 1100.0);
    model.remove_all_offshell_decays(&mut RngHandle::from_seed(3));
    let good = StateDict::from_model(&model);
    let mut broken = good.clone();
    broken.masses.remove(&catalog.lsp);
    let seed_file = dir.path().join("seed.json");
    fs::write(&seed_file, state_dicts_to_json(&[good, broken]).unwrap()).unwrap();

    let mut config = run_config(&dir.path().join("run"), 10);
    config.walkers = 3;
    config.seed_file = Some(seed_file);
    let report = run_pool(&config, &PoolOptions::default()).unwrap();

    assert_eq!(report.walkers.len(), 3);
    assert_eq!(report.failed(), 1);
    assert!(report.walkers[0].is_success());
    assert!(report.walkers[2].is_success());
    match &report.walkers[1].status {
        WalkerStatus::Failed { error } => assert!(error.contains("missing-lsp"), "{error}"),
        WalkerStatus::Completed => panic!("walker 1 should have failed"),
    }
    let run_dir = dir.path().join("run");
    assert!(report_path(&run_dir.join("walker0")).exists());
    assert!(!report_path(&run_dir.join("walker1")).exists());
    let exceptions = fs::read_to_string(run_dir.join("exceptions.log")).unwrap();
    assert!(exceptions.contains("missing-lsp"));
    assert!(run_dir.join("pool_report.json").exists());
    assert!(report.best().is_some());
    assert!(report.to_string().contains("failed"));
}
