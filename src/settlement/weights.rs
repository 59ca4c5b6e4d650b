use crate::models::{UserEpochStat, WeightAssignment};

/// Each user's share of the epoch's correct predictions, as an integer percentage.
///
/// `weight = floor(correct * 100 / Σ correct)`. Returns nothing when nobody predicted
/// correctly, in which case no weights are persisted or pushed.
pub fn compute_weights(stats: &[UserEpochStat]) -> Vec<WeightAssignment> {
    let total_correct: u128 = stats
        .iter()
        .map(|s| u128::from(s.correct_predictions))
        .sum();
    if total_correct == 0 {
        return Vec::new();
    }

    stats
        .iter()
        .map(|s| WeightAssignment {
            stat_id: s.id,
            user_address: s.user_address.clone(),
            weight: (u128::from(s.correct_predictions) * 100 / total_correct) as u64,
        })
        .collect()
}

/// Parallel address/weight vectors in the shape the sink's batch update takes.
pub fn split_for_push(weights: &[WeightAssignment]) -> (Vec<String>, Vec<u64>) {
    weights
        .iter()
        .map(|w| (w.user_address.clone(), w.weight))
        .unzip()
}
