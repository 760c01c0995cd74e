use super::{aligned_len, require_inputs, AggregationResult, AggregationStrategy, MIN_INPUTS};
use crate::types::{AggregatedResult, ClassScore, Prediction};

/// Majority vote per position of the aligned prediction vectors.
///
/// The winning label at each position carries its vote share as probability.
/// Ties go to the label that was seen first.
#[derive(Debug, Clone, Default)]
pub struct MajorityVoting;

impl AggregationStrategy for MajorityVoting {
    fn name(&self) -> &'static str {
        "majority_voting"
    }

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult> {
        require_inputs(predictions, MIN_INPUTS)?;
        let len = aligned_len(predictions)?;
        let voters = predictions.len() as f64;

        let prediction = (0..len)
            .map(|position| {
                let mut tally: Vec<(&str, usize)> = Vec::new();
                for prediction in predictions {
                    let label = prediction[position].label();
                    match tally.iter_mut().find(|(seen, _)| *seen == label) {
                        Some(entry) => entry.1 += 1,
                        None => tally.push((label, 1)),
                    }
                }

                let mut winner = tally[0];
                for candidate in &tally[1..] {
                    if candidate.1 > winner.1 {
                        winner = *candidate;
                    }
                }
                ClassScore::new(winner.0, winner.1 as f64 / voters)
            })
            .collect();

        Ok(AggregatedResult::new(request_id, prediction))
    }
}
