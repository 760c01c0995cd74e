use super::{aligned_len, require_inputs, AggregationResult, AggregationStrategy, MIN_INPUTS};
use crate::types::{AggregatedResult, ClassScore, Prediction};

/// Per-position median of the raw score vectors. Labels come from the first
/// prediction; an even count averages the two middle values.
#[derive(Debug, Clone, Default)]
pub struct Median;

impl AggregationStrategy for Median {
    fn name(&self) -> &'static str {
        "median"
    }

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult> {
        require_inputs(predictions, MIN_INPUTS)?;
        let len = aligned_len(predictions)?;

        let prediction = (0..len)
            .map(|position| {
                let mut column: Vec<f64> = predictions.iter().map(|p| p[position].probability()).collect();
                column.sort_by(|a, b| a.total_cmp(b));
                ClassScore::new(predictions[0][position].label(), median_of_sorted(&column))
            })
            .collect();

        Ok(AggregatedResult::new(request_id, prediction))
    }
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::test_support::{assert_scores, prediction};
    use crate::aggregation::AggregationError;

    #[test]
    fn test_odd_count_picks_middle() {
        let predictions = vec![
            prediction(&[("cat", 0.9), ("dog", 0.1)]),
            prediction(&[("cat", 0.2), ("dog", 0.8)]),
            prediction(&[("cat", 0.6), ("dog", 0.4)]),
        ];

        let result = Median.reduce(&predictions, "req-1").unwrap();

        assert_scores(&result.prediction, &[("cat", 0.6), ("dog", 0.4)]);
    }

    #[test]
    fn test_even_count_averages_middle_pair() {
        let predictions = vec![
            prediction(&[("cat", 0.9)]),
            prediction(&[("cat", 0.5)]),
            prediction(&[("cat", 0.3)]),
            prediction(&[("cat", 0.1)]),
        ];

        let result = Median.reduce(&predictions, "req-2").unwrap();

        assert_scores(&result.prediction, &[("cat", 0.4)]);
    }

    #[test]
    fn test_median_needs_two() {
        let single = vec![prediction(&[("cat", 0.9)])];
        assert_eq!(
            Median.reduce(&single, "req-3"),
            Err(AggregationError::InsufficientInput { got: 1, need: 2 })
        );
    }
}
