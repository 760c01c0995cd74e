pub mod supervisor;

pub use supervisor::*;

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, ConnectionError, ConnectionManager, Connector, Delivery, RetryPolicy};
use crate::config::Settings;
use crate::database::ResultStore;
use crate::types::{utc_to_epoch, AggregatedResult};

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("message body is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("message is not an aggregated result: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("message has an empty request_id")]
    MissingRequestId,

    #[error("failed to persist result: {0}")]
    Persist(String),
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub worker: String,
    pub queue: String,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub redelivery_delay: Duration,
}

impl ConsumerOptions {
    pub fn from_settings(worker: impl Into<String>, settings: &Settings) -> Self {
        Self {
            worker: worker.into(),
            queue: settings.broker.queue_name.clone(),
            lease: settings.consumer.lease(),
            poll_interval: settings.consumer.poll_interval(),
            redelivery_delay: settings.consumer.redelivery_delay(),
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Persisted and acked. `written` is false when the row already existed.
    Stored { written: bool },
    /// Left unacknowledged for redelivery.
    Rejected,
}

/// One consumer worker: leases messages from the durable queue, stores them
/// and acks only after the store call returned.
pub struct ResultConsumer<C: Connector> {
    manager: ConnectionManager<C>,
    store: Arc<ResultStore>,
    options: ConsumerOptions,
}

impl<C: Connector> ResultConsumer<C> {
    pub fn new(connector: C, store: Arc<ResultStore>, policy: &RetryPolicy, options: ConsumerOptions) -> Self {
        Self {
            manager: ConnectionManager::new(connector, options.queue.clone(), policy),
            store,
            options,
        }
    }

    /// Consume until `shutdown` resolves. Only a spent connection budget ends
    /// the loop with an error; bad messages never do.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ConnectionError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Consuming from '{}'", self.options.queue);

        loop {
            let polled = tokio::select! {
                _ = &mut shutdown => break,
                polled = self.poll_once() => polled?,
            };

            if polled.is_none() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        info!("Consumer stopped, broker {}", self.manager.state());
        Ok(())
    }

    /// Handle at most one message. `Ok(None)` means there was nothing to do
    /// right now (empty queue or a broker error that forced a reconnect).
    pub async fn poll_once(&mut self) -> Result<Option<DeliveryOutcome>, ConnectionError> {
        let broker = self.manager.connect().await?;

        let delivery = match broker
            .fetch(&self.options.queue, &self.options.worker, self.options.lease)
            .await
        {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Fetch from '{}' failed: {}", self.options.queue, e);
                self.manager.mark_disconnected();
                return Ok(None);
            }
        };

        Ok(Some(self.handle(broker.as_ref(), delivery).await))
    }

    async fn handle(&mut self, broker: &dyn Broker, delivery: Delivery) -> DeliveryOutcome {
        if delivery.redelivered() {
            debug!(
                "Message {} redelivered (delivery {}, first queued {})",
                delivery.message.message_id, delivery.delivery_count, delivery.enqueued_at
            );
        }

        match self.process(&delivery).await {
            Ok(written) => {
                match broker.ack(&delivery).await {
                    Ok(()) => debug!("Acked message {}", delivery.message.message_id),
                    Err(e) => self.settle_failed("ack", e),
                }
                DeliveryOutcome::Stored { written }
            }
            Err(e) => {
                error!(
                    worker = %self.options.worker,
                    message_id = %delivery.message.message_id,
                    delivery_count = delivery.delivery_count,
                    body = %String::from_utf8_lossy(&delivery.message.body),
                    "Rejecting message: {}",
                    e
                );
                if let Err(e) = broker.nack(&delivery, self.options.redelivery_delay).await {
                    self.settle_failed("nack", e);
                }
                DeliveryOutcome::Rejected
            }
        }
    }

    /// Failed acks and nacks leave the message to lease expiry.
    fn settle_failed(&mut self, action: &str, err: BrokerError) {
        match err {
            BrokerError::LeaseLost(message_id) => {
                warn!("Could not {} {}: lease expired and the message was handed out again", action, message_id);
            }
            other => {
                warn!("Could not {} message: {}", action, other);
                self.manager.mark_disconnected();
            }
        }
    }

    /// decode -> parse -> stamp `end_time` -> store
    async fn process(&self, delivery: &Delivery) -> Result<bool, ConsumerError> {
        let body = std::str::from_utf8(&delivery.message.body)?;
        let mut result: AggregatedResult = serde_json::from_str(body)?;
        if result.request_id.trim().is_empty() {
            return Err(ConsumerError::MissingRequestId);
        }

        result.end_time = Some(utc_to_epoch(Utc::now()));

        let written = self
            .store
            .upsert_result(&result)
            .await
            .map_err(|e| ConsumerError::Persist(format!("{:#}", e)))?;

        if written {
            info!("Stored result {}", result);
        } else {
            info!("Result for {} was already stored, acking duplicate", result.request_id);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{QueueMessage, SqlBroker, SqlConnector};
    use crate::types::ClassScore;
    use tempfile::TempDir;

    const QUEUE: &str = "object_detection_result";

    struct Fixture {
        _dir: TempDir,
        broker: SqlBroker,
        store: Arc<ResultStore>,
        consumer: ResultConsumer<SqlConnector>,
    }

    async fn fixture(redelivery_delay: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let queue_url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let store_url = format!("sqlite://{}", dir.path().join("results.db").display());

        let broker = SqlBroker::connect(&queue_url).await.unwrap();
        broker.declare_queue(QUEUE, true).await.unwrap();
        let store = Arc::new(ResultStore::new(&store_url).await.unwrap());

        let options = ConsumerOptions {
            worker: "worker-0".to_string(),
            queue: QUEUE.to_string(),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            redelivery_delay,
        };
        let consumer = ResultConsumer::new(
            SqlConnector::new(queue_url),
            Arc::clone(&store),
            &RetryPolicy::default(),
            options,
        );

        Fixture {
            _dir: dir,
            broker,
            store,
            consumer,
        }
    }

    fn sample(request_id: &str) -> AggregatedResult {
        AggregatedResult::new(request_id, vec![ClassScore::new("cat", 0.8), ClassScore::new("dog", 0.2)])
            .with_timestamp(Some(1_700_000_000.0))
    }

    #[tokio::test]
    async fn test_valid_message_is_stored_and_acked() {
        let mut f = fixture(Duration::from_secs(60)).await;
        f.broker
            .publish(&QueueMessage::encode(QUEUE, &sample("frame-1")).unwrap())
            .await
            .unwrap();

        let outcome = f.consumer.poll_once().await.unwrap();

        assert_eq!(outcome, Some(DeliveryOutcome::Stored { written: true }));
        assert_eq!(f.broker.message_count(QUEUE).await.unwrap(), 0);

        let stored = f.store.get_result("frame-1").await.unwrap().unwrap();
        assert_eq!(stored.prediction_label.as_deref(), Some("cat"));
        assert!(stored.end_time.unwrap() > stored.timestamp.unwrap());
        assert_eq!(f.consumer.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poison_message_does_not_stop_the_worker() {
        let mut f = fixture(Duration::from_secs(60)).await;
        f.broker.publish(&QueueMessage::new(QUEUE, b"{not json".to_vec())).await.unwrap();
        f.broker
            .publish(&QueueMessage::new(QUEUE, br#"{"request_id":" ","prediction":[]}"#.to_vec()))
            .await
            .unwrap();
        f.broker
            .publish(&QueueMessage::encode(QUEUE, &sample("frame-2")).unwrap())
            .await
            .unwrap();

        assert_eq!(f.consumer.poll_once().await.unwrap(), Some(DeliveryOutcome::Rejected));
        assert_eq!(f.consumer.poll_once().await.unwrap(), Some(DeliveryOutcome::Rejected));
        assert_eq!(
            f.consumer.poll_once().await.unwrap(),
            Some(DeliveryOutcome::Stored { written: true })
        );

        // rejected messages stay queued for redelivery
        assert_eq!(f.broker.message_count(QUEUE).await.unwrap(), 2);
        assert_eq!(f.store.count_results().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_message_is_redelivered() {
        let mut f = fixture(Duration::ZERO).await;
        f.broker.publish(&QueueMessage::new(QUEUE, vec![0xff, 0xfe])).await.unwrap();

        assert_eq!(f.consumer.poll_once().await.unwrap(), Some(DeliveryOutcome::Rejected));

        let redelivered = f
            .broker
            .fetch(QUEUE, "worker-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let mut f = fixture(Duration::from_secs(60)).await;
        let result = sample("5f0c6f3e-2d4b-4c8e-9a51-3b7d2f0e6a11");
        f.broker.publish(&QueueMessage::encode(QUEUE, &result).unwrap()).await.unwrap();
        f.broker.publish(&QueueMessage::encode(QUEUE, &result).unwrap()).await.unwrap();

        assert_eq!(
            f.consumer.poll_once().await.unwrap(),
            Some(DeliveryOutcome::Stored { written: true })
        );
        let first = f.store.get_result(&result.request_id).await.unwrap().unwrap();

        assert_eq!(
            f.consumer.poll_once().await.unwrap(),
            Some(DeliveryOutcome::Stored { written: false })
        );

        assert_eq!(f.store.count_results().await.unwrap(), 1);
        assert_eq!(f.store.get_result(&result.request_id).await.unwrap().unwrap(), first);
        assert_eq!(first.id.to_string(), result.request_id);
        assert_eq!(f.broker.message_count(QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let Fixture {
            _dir,
            broker,
            store,
            mut consumer,
        } = fixture(Duration::from_secs(60)).await;
        broker
            .publish(&QueueMessage::encode(QUEUE, &sample("frame-3")).unwrap())
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            consumer
                .run(async move {
                    let _ = rx.await;
                })
                .await
        });

        for _ in 0..100 {
            if store.count_results().await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(()).unwrap();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(store.count_results().await.unwrap(), 1);
    }
}
