use pm_core::derive_substream_seed;

/// Derives the deterministic seed of a walker.
pub fn walker_seed(master_seed: u64, walker_id: usize) -> u64 {
    derive_substream_seed(master_seed, walker_id as u64)
}

/// Derives the deterministic seed of one step of one walker.
///
/// Depends only on `(master_seed, walker_id, step)`, so a walker resumed
/// from a checkpoint draws exactly what the uninterrupted run would have.
pub fn step_seed(master_seed: u64, walker_id: usize, step: u64) -> u64 {
    derive_substream_seed(walker_seed(master_seed, walker_id), step)
}

/// Seed of the random starting point of a walker.
pub fn start_seed(master_seed: u64, walker_id: usize) -> u64 {
    derive_substream_seed(master_seed ^ 0xA5A5_A5A5_A5A5_A5A5, walker_id as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_separate_walkers_and_steps() {
        assert_eq!(step_seed(7, 1, 3), step_seed(7, 1, 3));
        assert_ne!(step_seed(7, 1, 3), step_seed(7, 2, 3));
        assert_ne!(step_seed(7, 1, 3), step_seed(7, 1, 4));
        assert_ne!(start_seed(7, 0), walker_seed(7, 0));
    }
}
