use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use super::runtime::{ActiveEnsemble, ConfigUpdate, EnsembleConfig};
use super::ConfigError;
use crate::aggregation::StrategyRegistry;

#[derive(Debug, Clone, Serialize)]
pub enum ConfigChangeEvent {
    EndpointsUpdated(usize),
    StrategyUpdated(String),
    FullConfigUpdated,
}

/// Holds the active ensemble configuration.
///
/// Readers take an `Arc` snapshot and keep it for the whole fan-out; writers
/// validate first and then replace the snapshot under the single write lock,
/// so a reader never sees a half-applied update.
pub struct ConfigStore {
    current: RwLock<Arc<ActiveEnsemble>>,
    registry: StrategyRegistry,
    change_tx: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigStore {
    pub fn new(initial: EnsembleConfig) -> Result<Self, ConfigError> {
        Self::with_registry(initial, StrategyRegistry::default())
    }

    pub fn with_registry(initial: EnsembleConfig, registry: StrategyRegistry) -> Result<Self, ConfigError> {
        let active = initial.activate(&registry)?;
        let (change_tx, _) = broadcast::channel(32);
        Ok(Self {
            current: RwLock::new(Arc::new(active)),
            registry,
            change_tx,
        })
    }

    pub async fn snapshot(&self) -> Arc<ActiveEnsemble> {
        Arc::clone(&*self.current.read().await)
    }

    /// Replace the whole configuration.
    pub async fn swap(&self, new_config: EnsembleConfig) -> Result<Arc<ActiveEnsemble>, ConfigError> {
        let active = Arc::new(new_config.activate(&self.registry)?);

        *self.current.write().await = Arc::clone(&active);

        info!(
            "Ensemble configuration replaced: {} endpoints, strategy={}",
            active.endpoints().len(),
            active.strategy.name()
        );
        let _ = self.change_tx.send(ConfigChangeEvent::FullConfigUpdated);
        Ok(active)
    }

    /// Apply a partial update against the current configuration. Merge and
    /// replace happen under the same write lock so concurrent updates cannot
    /// overwrite each other's fields. An update naming both fields is a swap.
    pub async fn update(&self, update: ConfigUpdate) -> Result<Arc<ActiveEnsemble>, ConfigError> {
        if update.is_empty() {
            return Err(ConfigError::Invalid("update names neither endpoints nor strategy".to_string()));
        }
        if let ConfigUpdate {
            endpoints: Some(endpoints),
            strategy: Some(strategy),
        } = update
        {
            return self.swap(EnsembleConfig::new(endpoints, strategy)).await;
        }
        let endpoints_changed = update.endpoints.is_some();
        let strategy_changed = update.strategy.is_some();

        let mut current = self.current.write().await;
        let merged = update.apply_to(&current.config);
        let active = Arc::new(merged.activate(&self.registry)?);
        *current = Arc::clone(&active);
        drop(current);

        if endpoints_changed {
            info!("Ensemble endpoints updated: {:?}", active.endpoints().iter().map(|e| e.label()).collect::<Vec<_>>());
            let _ = self.change_tx.send(ConfigChangeEvent::EndpointsUpdated(active.endpoints().len()));
        }
        if strategy_changed {
            info!("Aggregation strategy updated: {}", active.strategy.name());
            let _ = self
                .change_tx
                .send(ConfigChangeEvent::StrategyUpdated(active.config.strategy.name.clone()));
        }
        Ok(active)
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_tx.subscribe()
    }
}
