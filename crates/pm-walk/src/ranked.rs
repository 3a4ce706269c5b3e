use std::path::Path;

use pm_core::errors::PmError;
use pm_core::RngHandle;
use pm_model::{load_state_dicts, StateDict};

/// Geometric rank weights `2^-i`, normalized.
pub fn rank_weights(len: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..len).map(|rank| 0.5f64.powi(rank as i32)).collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|weight| weight / total).collect()
}

/// Draws a rank with geometric preference for the top of the list.
pub fn sample_rank(len: usize, rng: &mut RngHandle) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let draw = rng.unit();
    let mut cumulative = 0.0;
    for (rank, weight) in rank_weights(len).into_iter().enumerate() {
        cumulative += weight;
        if draw < cumulative {
            return Some(rank);
        }
    }
    Some(len - 1)
}

/// Picks a teleport target from a ranked-states file.
///
/// A missing file means nobody published yet and yields `None`.
pub fn pick_teleport_target(
    path: &Path,
    rng: &mut RngHandle,
) -> Result<Option<StateDict>, PmError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut states = load_state_dicts(path)?;
    let Some(rank) = sample_rank(states.len(), rng) else {
        return Ok(None);
    };
    Ok(Some(states.swap_remove(rank)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_halve_per_rank() {
        let weights = rank_weights(3);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((weights[0] - 4.0 / 7.0).abs() < 1e-12);
        assert!((weights[2] - 1.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn top_rank_dominates() {
        let mut rng = RngHandle::from_seed(11);
        let mut counts = [0usize; 4];
        for _ in 0..4000 {
            counts[sample_rank(4, &mut rng).unwrap()] += 1;
        }
        assert!(counts[0] > counts[1] && counts[1] > counts[2]);
        assert_eq!(sample_rank(0, &mut rng), None);
    }
}
