use super::average::class_mean;
use super::{require_inputs, AggregationError, AggregationResult, AggregationStrategy, MIN_INPUTS};
use crate::types::{AggregatedResult, Prediction};

/// Per-class mean with each backend scaled by its configured weight.
///
/// Weights are positional: the i-th weight belongs to the i-th prediction.
/// A fan-out that lost a backend therefore no longer lines up with the
/// configured weights and is rejected instead of silently re-weighted.
#[derive(Debug, Clone)]
pub struct WeightedAverage {
    weights: Vec<f64>,
}

impl WeightedAverage {
    pub fn new(weights: Vec<f64>) -> AggregationResult<Self> {
        if weights.is_empty() {
            return Err(AggregationError::InvalidParameter(
                "weighted_average needs at least one weight".to_string(),
            ));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AggregationError::InvalidParameter(
                "weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(AggregationError::InvalidParameter(
                "weights must not all be zero".to_string(),
            ));
        }
        Ok(Self { weights })
    }
}

impl AggregationStrategy for WeightedAverage {
    fn name(&self) -> &'static str {
        "weighted_average"
    }

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult> {
        if predictions.len() != self.weights.len() {
            return Err(AggregationError::MismatchedInputSizes {
                what: "weights",
                expected: self.weights.len(),
                actual: predictions.len(),
            });
        }
        require_inputs(predictions, MIN_INPUTS)?;

        Ok(AggregatedResult::new(request_id, class_mean(predictions, &self.weights)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::test_support::{assert_scores, prediction};

    #[test]
    fn test_weighted_mean_per_class() {
        let strategy = WeightedAverage::new(vec![3.0, 1.0]).unwrap();
        let predictions = vec![
            prediction(&[("cat", 0.8), ("dog", 0.2)]),
            prediction(&[("cat", 0.4), ("fox", 0.6)]),
        ];

        let result = strategy.reduce(&predictions, "req-1").unwrap();

        // cat: (0.8*3 + 0.4*1) / 4, dog and fox only from their reporter
        assert_scores(&result.prediction, &[("cat", 0.7), ("dog", 0.2), ("fox", 0.6)]);
    }

    #[test]
    fn test_mismatched_weights_rejected_first() {
        let strategy = WeightedAverage::new(vec![0.5, 0.3, 0.2]).unwrap();

        let two = vec![prediction(&[("cat", 0.8)]), prediction(&[("cat", 0.6)])];
        assert_eq!(
            strategy.reduce(&two, "req-2"),
            Err(AggregationError::MismatchedInputSizes {
                what: "weights",
                expected: 3,
                actual: 2
            })
        );

        // A single prediction is a size mismatch before it is an input shortage.
        let one = vec![prediction(&[("cat", 0.8)])];
        assert!(matches!(
            strategy.reduce(&one, "req-2"),
            Err(AggregationError::MismatchedInputSizes { .. })
        ));
    }

    #[test]
    fn test_single_weight_still_needs_two_inputs() {
        let strategy = WeightedAverage::new(vec![1.0]).unwrap();
        let one = vec![prediction(&[("cat", 0.8)])];

        assert_eq!(
            strategy.reduce(&one, "req-3"),
            Err(AggregationError::InsufficientInput { got: 1, need: 2 })
        );
    }

    #[test]
    fn test_invalid_weights() {
        assert!(WeightedAverage::new(vec![]).is_err());
        assert!(WeightedAverage::new(vec![1.0, -0.5]).is_err());
        assert!(WeightedAverage::new(vec![0.0, 0.0]).is_err());
        assert!(WeightedAverage::new(vec![f64::NAN, 1.0]).is_err());
    }
}
