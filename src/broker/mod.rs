pub mod connection;
pub mod publisher;
pub mod sql;

pub use connection::*;
pub use publisher::*;
pub use sql::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::types::AggregatedResult;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("queue '{queue}' already exists with durable={durable}")]
    QueueMismatch { queue: String, durable: bool },

    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("lease on message {0} is no longer held by this consumer")]
    LeaseLost(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A wire-encoded `AggregatedResult` plus its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Target queue name (default-exchange routing).
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl QueueMessage {
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            routing_key: routing_key.into(),
            body,
        }
    }

    pub fn encode(routing_key: impl Into<String>, result: &AggregatedResult) -> Result<Self, BrokerError> {
        Ok(Self::new(routing_key, serde_json::to_vec(result)?))
    }
}

/// A message leased to one consumer. It stays invisible to other consumers
/// until it is acked, nacked, or the lease expires.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: i64,
    pub consumer: String,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub message: QueueMessage,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue, or confirm an existing one has the same properties.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn publish(&self, message: &QueueMessage) -> Result<(), BrokerError>;

    /// Lease the oldest available message of `queue`, if any.
    async fn fetch(&self, queue: &str, consumer: &str, lease: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Give the message back; it becomes visible again after `requeue_after`.
    async fn nack(&self, delivery: &Delivery, requeue_after: Duration) -> Result<(), BrokerError>;

    async fn message_count(&self, queue: &str) -> Result<u64, BrokerError>;
}
