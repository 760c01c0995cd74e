use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerError, SqlBroker};

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_secs: 2,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// The full sleep sequence a worker goes through before giving up.
    pub fn delays(&self) -> Vec<Duration> {
        let mut state = RetryState::new(self);
        std::iter::from_fn(|| state.next_delay()).collect()
    }
}

/// Backoff progress of the current outage. Lives only as long as the process.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    delay: Duration,
    initial: Duration,
    ceiling: Duration,
    max_retries: u32,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        let initial = Duration::from_secs(policy.initial_delay_secs);
        Self {
            attempts: 0,
            delay: initial,
            initial,
            ceiling: Duration::from_secs(policy.max_delay_secs),
            max_retries: policy.max_retries,
        }
    }

    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` when the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts > self.max_retries {
            return None;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.ceiling);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.initial;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("gave up connecting to the broker after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("queue declaration rejected: {0}")]
    Declare(BrokerError),
}

/// Opens a fresh broker handle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

#[derive(Debug, Clone)]
pub struct SqlConnector {
    url: String,
}

impl SqlConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for SqlConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::new(SqlBroker::connect(&self.url).await?))
    }
}

/// Drives `Disconnected -> Connecting -> Connected` for one worker and
/// declares the target queue durable on every successful connect.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    queue: String,
    retry: RetryState,
    state: ConnectionState,
    broker: Option<Arc<dyn Broker>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, queue: impl Into<String>, policy: &RetryPolicy) -> Self {
        Self {
            connector,
            queue: queue.into(),
            retry: RetryState::new(policy),
            state: ConnectionState::Disconnected,
            broker: None,
        }
    }

    /// Return the live broker, connecting with backoff if needed.
    pub async fn connect(&mut self) -> Result<Arc<dyn Broker>, ConnectionError> {
        if let (ConnectionState::Connected, Some(broker)) = (self.state, &self.broker) {
            return Ok(Arc::clone(broker));
        }

        debug!("Broker {} -> {}", self.state, ConnectionState::Connecting);
        self.state = ConnectionState::Connecting;
        loop {
            let failure = match self.connector.connect().await {
                Ok(broker) => match broker.declare_queue(&self.queue, true).await {
                    Ok(()) => {
                        if self.retry.attempts() > 0 {
                            info!("Broker connection restored after {} failed attempts", self.retry.attempts());
                        } else {
                            info!("Connected to broker, queue '{}' ready", self.queue);
                        }
                        self.retry.reset();
                        self.state = ConnectionState::Connected;
                        self.broker = Some(Arc::clone(&broker));
                        return Ok(broker);
                    }
                    Err(e @ BrokerError::QueueMismatch { .. }) => {
                        error!("Queue '{}' cannot be declared: {}", self.queue, e);
                        self.state = ConnectionState::Disconnected;
                        return Err(ConnectionError::Declare(e));
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            match self.retry.next_delay() {
                Some(delay) => {
                    warn!(
                        "Broker connection attempt {} failed: {}. Retrying in {:?}",
                        self.retry.attempts(),
                        failure,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let attempts = self.retry.attempts();
                    error!("Broker unreachable after {} attempts: {}", attempts, failure);
                    // the next outage starts from a full budget
                    self.retry.reset();
                    self.state = ConnectionState::Disconnected;
                    return Err(ConnectionError::Exhausted {
                        attempts,
                        last_error: failure.to_string(),
                    });
                }
            }
        }
    }

    /// Drop the current handle after an operation failed on it.
    pub fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("Broker connection lost");
        }
        self.state = ConnectionState::Disconnected;
        self.broker = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

}
