#![cfg(unix)]

use std::path::{Path, PathBuf};

use pm_core::RngHandle;
use pm_model::{CandidateModel, ParticleCatalog};
use pm_walk::oracle::ArtifactHandle;
use pm_walk::{CommandOracle, OracleConfig, RunConfig, ScoreOracle, Walker};
use tempfile::tempdir;

fn stop_model() -> CandidateModel {
    let catalog = ParticleCatalog::default();
    let mut model = CandidateModel::minimal(&catalog, 200.0, 0);
    model.masses.insert(1000006, 1150.0);
    model.remove_all_offshell_decays(&mut RngHandle::from_seed(1));
    model
}

/// `sh -c <script> scorer <artifact>`: the artifact path arrives as `$1`.
fn shell_oracle(script: &str, workdir: &Path) -> CommandOracle {
    CommandOracle::new(
        PathBuf::from("sh"),
        vec!["-c".to_string(), script.to_string(), "scorer".to_string()],
        workdir.to_path_buf(),
        4,
    )
}

const SCORER: &str = r#"grep -q 1000006 "$1" || exit 7
echo '{"score": 4.5, "significance": 2.1, "exclusion_ratio": 0.3, "best_combination": ["CMS-SUS-1"]}'"#;

#[test]
fn scores_come_from_the_program_output() {
    let dir = tempdir().unwrap();
    let mut oracle = shell_oracle(SCORER, dir.path());
    let mut model = stop_model();

    let artifact = oracle.produce_artifact(&model).unwrap();
    let ArtifactHandle::File(path) = &artifact else {
        panic!("expected a file artifact, got {artifact:?}");
    };
    assert_eq!(path, &dir.path().join("walker4_artifact.json"));
    assert!(std::fs::read_to_string(path).unwrap().contains("1000006"));

    let merit = oracle.evaluate(&mut model).unwrap();
    assert_eq!(merit.score, 4.5);
    assert_eq!(merit.muhat, 1.0);
    assert!(!merit.excluded);
    assert_eq!(model.score, 4.5);
    assert_eq!(model.significance, 2.1);
    assert_eq!(model.rmax, 0.3);
    assert!(model.best_combination.is_some());
}

#[test]
fn failing_program_reports_its_status() {
    let dir = tempdir().unwrap();
    let mut oracle = shell_oracle("echo 'no spectrum' >&2; exit 3", dir.path());
    let err = oracle.evaluate(&mut stop_model()).unwrap_err();
    assert_eq!(err.code(), "oracle-status");
    assert_eq!(err.info().context["stderr"], "no spectrum");
}

#[test]
fn unparsable_output_is_an_oracle_error() {
    let dir = tempdir().unwrap();
    let mut oracle = shell_oracle("echo 'K = 4.5'", dir.path());
    let mut model = stop_model();
    let err = oracle.evaluate(&mut model).unwrap_err();
    assert_eq!(err.code(), "oracle-output");
    assert_eq!(model.score, 0.0);
}

#[test]
fn missing_program_cannot_spawn() {
    let dir = tempdir().unwrap();
    let mut oracle = CommandOracle::new(
        dir.path().join("no-such-scorer"),
        Vec::new(),
        dir.path().to_path_buf(),
        0,
    );
    let err = oracle.evaluate(&mut stop_model()).unwrap_err();
    assert_eq!(err.code(), "oracle-spawn");
}

#[test]
fn configured_command_drives_a_walker() {
    let dir = tempdir().unwrap();
    let mut config = RunConfig {
        max_steps: Some(4),
        ..RunConfig::default()
    };
    config.oracle = OracleConfig::Command {
        program: PathBuf::from("sh"),
        args: vec![
            "-c".to_string(),
            r#"test -f "$1" && echo '{"score": 1.5}'"#.to_string(),
            "scorer".to_string(),
        ],
        workdir: Some(dir.path().to_path_buf()),
    };
    let oracle = pm_walk::build_oracle(&config.oracle, 2);
    let mut walker = Walker::random_start(&config, 2, oracle).unwrap();
    let report = walker.run().unwrap();
    assert_eq!(report.steps_completed, 4);
    assert_eq!(report.stats.voided, 0);
    assert_eq!(report.stats.accepted, 4);
    assert_eq!(walker.model().score, 1.5);
    assert!(dir.path().join("walker2_artifact.json").exists());
}
