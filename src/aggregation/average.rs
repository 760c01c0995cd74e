use std::collections::HashMap;

use super::{require_inputs, AggregationResult, AggregationStrategy, MIN_INPUTS};
use crate::types::{AggregatedResult, ClassScore, Prediction};

/// Per-class mean over the backends that reported the class.
#[derive(Debug, Clone, Default)]
pub struct Average;

impl AggregationStrategy for Average {
    fn name(&self) -> &'static str {
        "average"
    }

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult> {
        require_inputs(predictions, MIN_INPUTS)?;

        let uniform = vec![1.0; predictions.len()];
        Ok(AggregatedResult::new(request_id, class_mean(predictions, &uniform)))
    }
}

/// Weighted per-class mean. A class only averages over the backends that
/// reported it, so missing classes are never treated as zero. Output keeps
/// first-seen class order.
pub(crate) fn class_mean(predictions: &[Prediction], weights: &[f64]) -> Prediction {
    let mut order: Vec<&str> = Vec::new();
    let mut totals: HashMap<&str, (f64, f64)> = HashMap::new();

    for (prediction, &weight) in predictions.iter().zip(weights) {
        for (label, probability) in merge_labels(prediction) {
            let entry = totals.entry(label).or_insert_with(|| {
                order.push(label);
                (0.0, 0.0)
            });
            entry.0 += probability * weight;
            entry.1 += weight;
        }
    }

    order
        .into_iter()
        .map(|label| {
            let (sum, weight) = totals[label];
            let mean = if weight > 0.0 { sum / weight } else { 0.0 };
            ClassScore::new(label, mean)
        })
        .collect()
}

/// One entry per label for a single backend; repeated labels add up, so
/// the backend still counts as one reporter.
fn merge_labels(prediction: &Prediction) -> Vec<(&str, f64)> {
    let mut merged: Vec<(&str, f64)> = Vec::with_capacity(prediction.len());
    for score in prediction {
        match merged.iter_mut().find(|(label, _)| *label == score.label()) {
            Some((_, probability)) => *probability += score.probability(),
            None => merged.push((score.label(), score.probability())),
        }
    }
    merged
}
