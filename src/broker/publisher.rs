use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{Broker, BrokerError, ConnectionError, ConnectionManager, Connector, QueueMessage, RetryPolicy};
use crate::types::AggregatedResult;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("broker reconnect already in progress")]
    Reconnecting,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Where aggregated results go once a fan-out succeeds.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: &AggregatedResult) -> Result<(), PublishError>;
}

/// Publishes results to the durable queue, reconnecting with backoff when
/// the previous handle failed.
///
/// Publishes only take the connection manager's lock to reconnect. While one
/// publish is backing off, the others fail with `Reconnecting` instead of
/// waiting out the whole schedule.
pub struct QueuePublisher<C: Connector> {
    queue: String,
    current: RwLock<Option<Arc<dyn Broker>>>,
    manager: Mutex<ConnectionManager<C>>,
}

impl<C: Connector> QueuePublisher<C> {
    pub fn new(connector: C, queue: impl Into<String>, policy: &RetryPolicy) -> Self {
        let queue = queue.into();
        Self {
            manager: Mutex::new(ConnectionManager::new(connector, queue.clone(), policy)),
            current: RwLock::new(None),
            queue,
        }
    }

    /// Connect ahead of the first publish.
    pub async fn connect(&self) -> Result<(), PublishError> {
        self.broker().await.map(|_| ())
    }

    async fn broker(&self) -> Result<Arc<dyn Broker>, PublishError> {
        if let Some(broker) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(broker));
        }

        let Ok(mut manager) = self.manager.try_lock() else {
            return Err(PublishError::Reconnecting);
        };
        // another publish may have reconnected between the read and the lock
        if let Some(broker) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(broker));
        }

        manager.mark_disconnected();
        let broker = manager.connect().await?;
        *self.current.write().await = Some(Arc::clone(&broker));
        Ok(broker)
    }

    async fn invalidate(&self, failed: &Arc<dyn Broker>) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|broker| Arc::ptr_eq(broker, failed)) {
            *current = None;
        }
    }
}

#[async_trait]
impl<C: Connector> ResultSink for QueuePublisher<C> {
    async fn publish(&self, result: &AggregatedResult) -> Result<(), PublishError> {
        let message = QueueMessage::encode(&self.queue, result)?;
        let broker = self.broker().await?;

        if let Err(e) = broker.publish(&message).await {
            self.invalidate(&broker).await;
            return Err(e.into());
        }

        debug!("Result for {} queued as {}", result.request_id, message.message_id);
        Ok(())
    }
}
