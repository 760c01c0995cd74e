use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ConfigError;
use crate::aggregation::{AggregationError, AggregationStrategy, StrategyConfig, StrategyRegistry};
use crate::types::BackendEndpoint;

/// The reconfigurable part of the ensemble: where to fan out and how to reduce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub endpoints: Vec<BackendEndpoint>,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

impl EnsembleConfig {
    pub fn new(endpoints: Vec<BackendEndpoint>, strategy: StrategyConfig) -> Self {
        Self { endpoints, strategy }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        for endpoint in &self.endpoints {
            if let Err(e) = reqwest::Url::parse(&endpoint.url) {
                return Err(ConfigError::InvalidEndpoint(endpoint.url.clone(), e.to_string()));
            }
        }

        let weights = self.strategy.weights.len();
        if !self.strategy.weights.is_empty() && weights != self.endpoints.len() {
            return Err(AggregationError::MismatchedInputSizes {
                what: "weights",
                expected: self.endpoints.len(),
                actual: weights,
            }
            .into());
        }

        Ok(())
    }

    /// Validate and resolve the strategy, producing the snapshot the
    /// coordinator reads.
    pub fn activate(self, registry: &StrategyRegistry) -> Result<ActiveEnsemble, ConfigError> {
        self.validate()?;
        let strategy = registry.build(&self.strategy)?;
        Ok(ActiveEnsemble {
            config: self,
            strategy,
        })
    }
}

/// Immutable configuration snapshot with its strategy already built.
#[derive(Debug, Clone)]
pub struct ActiveEnsemble {
    pub config: EnsembleConfig,
    pub strategy: Arc<dyn AggregationStrategy>,
}

impl ActiveEnsemble {
    pub fn endpoints(&self) -> &[BackendEndpoint] {
        &self.config.endpoints
    }
}

/// Partial replacement accepted by the reconfiguration endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub endpoints: Option<Vec<BackendEndpoint>>,
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_none() && self.strategy.is_none()
    }

    pub fn apply_to(self, current: &EnsembleConfig) -> EnsembleConfig {
        EnsembleConfig {
            endpoints: self.endpoints.unwrap_or_else(|| current.endpoints.clone()),
            strategy: self.strategy.unwrap_or_else(|| current.strategy.clone()),
        }
    }
}
