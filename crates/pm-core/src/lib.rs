#![deny(missing_docs)]
#![doc = "Shared error surface and deterministic randomness for the protomodel search engine."]

pub mod errors;
pub mod rng;

pub use errors::{ErrorInfo, PmError};
pub use rng::{derive_substream_seed, RngHandle};
