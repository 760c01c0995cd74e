use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    AggregationError, AggregationResult, AggregationStrategy, Average, MajorityVoting, Median,
    RankAveraging, WeightedAverage,
};

/// Strategy selection as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    /// Per-backend weights, only read by `weighted_average`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weights: Vec<f64>,
}

impl StrategyConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: Vec::new(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::named("average")
    }
}

type Constructor = fn(&StrategyConfig) -> AggregationResult<Arc<dyn AggregationStrategy>>;

/// Name to constructor mapping for aggregation strategies.
pub struct StrategyRegistry {
    constructors: BTreeMap<&'static str, Constructor>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, constructor: Constructor) -> &mut Self {
        self.constructors.insert(name, constructor);
        self
    }

    pub fn build(&self, config: &StrategyConfig) -> AggregationResult<Arc<dyn AggregationStrategy>> {
        let key = config.name.trim().to_lowercase();
        let constructor = self
            .constructors
            .get(key.as_str())
            .ok_or_else(|| AggregationError::UnknownStrategy(config.name.clone()))?;
        constructor(config)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register("average", |_| Ok(Arc::new(Average)))
            .register("average_probability", |_| Ok(Arc::new(Average)))
            .register("weighted_average", |config| {
                Ok(Arc::new(WeightedAverage::new(config.weights.clone())?))
            })
            .register("rank_averaging", |_| Ok(Arc::new(RankAveraging)))
            .register("majority_voting", |_| Ok(Arc::new(MajorityVoting)))
            .register("median", |_| Ok(Arc::new(Median)));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = StrategyRegistry::default();
        assert_eq!(
            registry.names(),
            vec![
                "average",
                "average_probability",
                "majority_voting",
                "median",
                "rank_averaging",
                "weighted_average"
            ]
        );
    }

    #[test]
    fn test_build_by_name() {
        let registry = StrategyRegistry::default();

        let strategy = registry.build(&StrategyConfig::named("Median")).unwrap();
        assert_eq!(strategy.name(), "median");

        let alias = registry.build(&StrategyConfig::named("average_probability")).unwrap();
        assert_eq!(alias.name(), "average");
    }

    #[test]
    fn test_unknown_strategy_fails_fast() {
        let registry = StrategyRegistry::default();
        let err = registry.build(&StrategyConfig::named("geometric_mean")).unwrap_err();
        assert_eq!(err, AggregationError::UnknownStrategy("geometric_mean".to_string()));
        assert!(!registry.names().contains(&"geometric_mean"));
    }

    #[test]
    fn test_weighted_average_validates_weights_at_build() {
        let registry = StrategyRegistry::default();

        let missing = registry.build(&StrategyConfig::named("weighted_average"));
        assert!(matches!(missing, Err(AggregationError::InvalidParameter(_))));

        let config = StrategyConfig {
            name: "weighted_average".to_string(),
            weights: vec![0.6, 0.4],
        };
        assert_eq!(registry.build(&config).unwrap().name(), "weighted_average");
    }
}
