//! Pure reductions from per-backend predictions to one aggregated result.
//!
//! Every strategy is stateless apart from its configuration and is looked up
//! by name through [`StrategyRegistry`], which is consulted when a
//! configuration is loaded or swapped so unknown names never reach a request.

pub mod average;
pub mod median;
pub mod rank;
pub mod registry;
pub mod voting;
pub mod weighted;

pub use average::Average;
pub use median::Median;
pub use rank::RankAveraging;
pub use registry::{StrategyConfig, StrategyRegistry};
pub use voting::MajorityVoting;
pub use weighted::WeightedAverage;

use std::fmt;

use crate::types::{AggregatedResult, Prediction};

/// Minimum number of successful predictions the built-in strategies accept.
pub const MIN_INPUTS: usize = 2;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("insufficient input: got {got} predictions, need at least {need}")]
    InsufficientInput { got: usize, need: usize },

    #[error("unknown aggregation strategy: {0}")]
    UnknownStrategy(String),

    #[error("mismatched input sizes for {what}: expected {expected}, got {actual}")]
    MismatchedInputSizes {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid strategy parameter: {0}")]
    InvalidParameter(String),
}

pub type AggregationResult<T> = Result<T, AggregationError>;

pub trait AggregationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn reduce(&self, predictions: &[Prediction], request_id: &str) -> AggregationResult<AggregatedResult>;
}

pub(crate) fn require_inputs(predictions: &[Prediction], need: usize) -> AggregationResult<()> {
    if predictions.len() < need {
        return Err(AggregationError::InsufficientInput {
            got: predictions.len(),
            need,
        });
    }
    Ok(())
}

/// Length shared by every prediction vector, for the position-wise strategies.
pub(crate) fn aligned_len(predictions: &[Prediction]) -> AggregationResult<usize> {
    let expected = predictions.first().map_or(0, Vec::len);
    for prediction in predictions {
        if prediction.len() != expected {
            return Err(AggregationError::MismatchedInputSizes {
                what: "prediction vector length",
                expected,
                actual: prediction.len(),
            });
        }
    }
    Ok(expected)
}
