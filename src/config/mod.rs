pub mod manager;
pub mod runtime;
pub mod settings;

pub use manager::*;
pub use runtime::*;
pub use settings::*;

use crate::aggregation::AggregationError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error(transparent)]
    Strategy(#[from] AggregationError),

    #[error("no backend endpoints configured")]
    NoEndpoints,

    #[error("invalid endpoint url '{0}': {1}")]
    InvalidEndpoint(String, String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
