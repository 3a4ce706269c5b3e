#![deny(missing_docs)]
#![doc = include_str!("../docs/walker-api.md")]

//! Stochastic protomodel walkers sharing a crash-safe hiscore list.

/// Walker checkpoint payloads and counters.
pub mod checkpoint;
/// YAML configuration schema and defaults.
pub mod config;
/// Deterministic seed derivation helpers.
pub mod determinism;
/// Shared leaderboard persistence.
pub mod hiscore;
/// Per-walker journals and the shared exceptions log.
pub mod journal;
/// Lock files and randomized backoff.
pub mod lock;
/// Branching ratio and signal strength operators.
pub mod moves_couplings;
/// Mass spectrum operators.
pub mod moves_spectrum;
/// Merger and relabeling operators.
pub mod moves_structure;
/// Operator dispatch for one step.
pub mod mutator;
/// Score oracle interface and implementations.
pub mod oracle;
/// Worker pool supervision.
pub mod pool;
/// Rank-weighted teleport targets.
pub mod ranked;
/// The walker step loop.
pub mod walker;

pub use checkpoint::{WalkerCheckpoint, WalkerStats};
pub use config::{
    AcceptanceRule, CheckpointConfig, HiscoreConfig, OperatorKnob, OracleConfig, OutputConfig,
    RunConfig, SeedPolicy, StepPolicy, SyntheticOracleConfig,
};
pub use hiscore::{compile_hiscores, ConsiderOutcome, HiscorePaths, HiscoreRecord, Hiscores};
pub use mutator::{MutationKind, MutationOutcome, Mutator};
pub use oracle::{build_oracle, CommandOracle, FigureOfMerit, ScoreOracle, SyntheticOracle};
pub use pool::{run_pool, run_walker, PoolMode, PoolOptions, PoolReport};
pub use walker::{StepOutcome, Walker, WalkerReport, WalkerStatus};
