use super::{aligned_len, require_inputs, AggregationResult, AggregationStrategy, MIN_INPUTS};
use crate::types::{AggregatedResult, ClassScore, Prediction};

/// Rank averaging over position-aligned score vectors.
///
/// Each vector is turned into ascending ranks (stable on ties), ranks are
/// averaged per position, and the mean rank is mapped back onto the value
/// scale through the mean sorted vector. Fractional ranks interpolate between
/// neighbouring values, so the output stays inside the inputs' min–max range
/// and identical inputs come back unchanged.
#[derive(Debug, Clone, Default)]
pub struct RankAveraging;

impl AggregationStrategy for RankAveraging {
    fn name(&self) -> &'static str {
        "rank_averaging"
    }

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult> {
        require_inputs(predictions, MIN_INPUTS)?;
        let len = aligned_len(predictions)?;
        let count = predictions.len() as f64;

        let mut rank_sums = vec![0usize; len];
        let mut sorted_sums = vec![0.0; len];

        for prediction in predictions {
            let scores: Vec<f64> = prediction.iter().map(ClassScore::probability).collect();

            for (position, rank) in ranks(&scores).into_iter().enumerate() {
                rank_sums[position] += rank;
            }

            let mut sorted = scores;
            sorted.sort_by(|a, b| a.total_cmp(b));
            for (position, value) in sorted.into_iter().enumerate() {
                sorted_sums[position] += value;
            }
        }

        let reference: Vec<f64> = sorted_sums.into_iter().map(|sum| sum / count).collect();

        let prediction = predictions[0]
            .iter()
            .zip(rank_sums)
            .map(|(score, rank_sum)| {
                let mean_rank = rank_sum as f64 / count;
                ClassScore::new(score.label(), interpolate(&reference, mean_rank))
            })
            .collect();

        Ok(AggregatedResult::new(request_id, prediction))
    }
}

/// Ascending ranks; equal scores keep their index order.
fn ranks(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0; scores.len()];
    for (rank, index) in order.into_iter().enumerate() {
        ranks[index] = rank;
    }
    ranks
}

fn interpolate(reference: &[f64], rank: f64) -> f64 {
    let last = reference.len() - 1;
    let lower = (rank.floor() as usize).min(last);
    let upper = (rank.ceil() as usize).min(last);
    let fraction = rank - lower as f64;

    reference[lower] + (reference[upper] - reference[lower]) * fraction
}
