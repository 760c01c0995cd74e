use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::runtime::EnsembleConfig;
use super::ConfigError;
use crate::aggregation::StrategyConfig;
use crate::backend::TensorShape;
use crate::broker::RetryPolicy;
use crate::types::BackendEndpoint;

const ENV_PREFIX: &str = "ENSEMBLE";

/// Process settings, read once at start from an optional TOML file layered
/// under `ENSEMBLE_*` environment variables (`ENSEMBLE_BROKER__URL`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub backend: BackendSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub consumer: ConsumerSettings,
    pub retry: RetryPolicy,
    pub ensemble: EnsembleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub job_queue_capacity: usize,
    pub publish_results: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5011,
            job_queue_capacity: 1024,
            publish_results: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub timeout_ms: u64,
    pub input_shape: TensorShape,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            input_shape: TensorShape::default(),
        }
    }
}

impl BackendSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub url: String,
    pub queue_name: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:./ensemble_queue.db".to_string(),
            queue_name: "object_detection_result".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub url: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:./ensemble_results.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub lease_secs: u64,
    pub redelivery_delay_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval_ms: 500,
            lease_secs: 30,
            redelivery_delay_ms: 1_000,
        }
    }
}

impl ConsumerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

/// Endpoint list as written in configuration. Besides explicit endpoints,
/// model names can be expanded through `url_template`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSettings {
    pub url_template: String,
    pub models: Vec<String>,
    pub strategy: StrategyConfig,
    pub endpoints: Vec<BackendEndpoint>,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            url_template: "http://{model}-service:5012/inference".to_string(),
            models: Vec::new(),
            strategy: StrategyConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

impl EnsembleSettings {
    pub fn to_config(&self) -> EnsembleConfig {
        let mut endpoints = self.endpoints.clone();
        endpoints.extend(
            self.models
                .iter()
                .map(|model| BackendEndpoint::for_model(model, &self.url_template)),
        );
        EnsembleConfig::new(endpoints, self.strategy.clone())
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let settings: Settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            // variable names the deployment manifests already use
            .set_override_option("consumer.workers", std::env::var("NUM_PROCESSES").ok())?
            .set_override_option("broker.queue_name", std::env::var("RABBITMQ_QUEUE_NAME").ok())?
            .set_override_option("server.publish_results", std::env::var("SEND_TO_QUEUE").ok())?
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.job_queue_capacity == 0 {
            errors.push("server.job_queue_capacity must be > 0");
        }
        if self.backend.timeout_ms == 0 {
            errors.push("backend.timeout_ms must be > 0");
        }
        if self.broker.queue_name.trim().is_empty() {
            errors.push("broker.queue_name must not be empty");
        }
        if self.consumer.workers == 0 {
            errors.push("consumer.workers must be > 0");
        }
        if self.consumer.lease_secs == 0 {
            errors.push("consumer.lease_secs must be > 0");
        }
        if self.retry.initial_delay_secs == 0 {
            errors.push("retry.initial_delay_secs must be > 0");
        }
        if self.retry.max_delay_secs < self.retry.initial_delay_secs {
            errors.push("retry.max_delay_secs must be >= retry.initial_delay_secs");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join(", ")))
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
