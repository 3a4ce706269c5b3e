#![deny(missing_docs)]

//! Candidate protomodel representation: particle keys, the search-space
//! catalog, the mutable model with its invariant-restoring primitives and the
//! plain dictionary export used by seed and ranked-states files.

/// Search-space catalog.
pub mod catalog;
/// Dictionary export of candidates.
pub mod dict;
/// The candidate model and its primitives.
pub mod model;
/// Particle ids, decay channels and production pair keys.
pub mod particles;

pub use catalog::ParticleCatalog;
pub use dict::{load_state_dicts, state_dicts_to_json, StateDict};
pub use model::{BestCombination, CandidateModel, DecayTable, ModelSnapshot, BR_EPSILON};
pub use particles::{is_frozen_mass, DaughterSpec, PairKey, ParticleId, FROZEN_MASS};
