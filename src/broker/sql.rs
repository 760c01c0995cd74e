use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{Broker, BrokerError, Delivery, QueueMessage};

/// Durable table queue on SQLite. Every worker process opens its own pool on
/// the same database file; WAL mode plus a busy timeout keep concurrent
/// claims from failing on lock contention.
#[derive(Debug, Clone)]
pub struct SqlBroker {
    pool: SqlitePool,
}

impl SqlBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let broker = Self { pool };
        broker.create_schema().await?;
        debug!("Broker connected at {}", url);
        Ok(broker)
    }

    async fn create_schema(&self) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queues (
                name TEXT PRIMARY KEY,
                durable INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                body BLOB NOT NULL,
                enqueued_at TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                locked_until INTEGER,
                consumer TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_messages_ready ON queue_messages(queue, locked_until, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, BrokerError> {
        let found = sqlx::query("SELECT 1 FROM queues WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl Broker for SqlBroker {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let inserted = sqlx::query(
            "INSERT INTO queues (name, durable, created_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(durable)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let existing: bool = sqlx::query_scalar("SELECT durable FROM queues WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        if existing != durable {
            return Err(BrokerError::QueueMismatch {
                queue: name.to_string(),
                durable: existing,
            });
        }

        if inserted.rows_affected() > 0 {
            info!("Declared queue '{}' (durable={})", name, durable);
        }
        Ok(())
    }

    async fn publish(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        if !self.queue_exists(&message.routing_key).await? {
            return Err(BrokerError::UnknownQueue(message.routing_key.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO queue_messages (message_id, queue, body, enqueued_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.routing_key)
        .bind(&message.body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("Published message {} to '{}'", message.message_id, message.routing_key);
        Ok(())
    }

    async fn fetch(&self, queue: &str, consumer: &str, lease: Duration) -> Result<Option<Delivery>, BrokerError> {
        let now = now_millis();

        // single statement, so two consumers can never claim the same row
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET locked_until = ?, consumer = ?, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, message_id, queue, body, enqueued_at, delivery_count
            "#,
        )
        .bind(now.saturating_add(millis(lease)))
        .bind(consumer)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delivery_count: i64 = row.try_get("delivery_count")?;
        let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;

        Ok(Some(Delivery {
            delivery_tag: row.try_get("id")?,
            consumer: consumer.to_string(),
            delivery_count: u32::try_from(delivery_count).unwrap_or(u32::MAX),
            enqueued_at,
            message: QueueMessage {
                message_id: row.try_get("message_id")?,
                routing_key: row.try_get("queue")?,
                body: row.try_get("body")?,
            },
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND consumer = ?")
            .bind(delivery.delivery_tag)
            .bind(&delivery.consumer)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::LeaseLost(delivery.message.message_id.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue_after: Duration) -> Result<(), BrokerError> {
        let result = sqlx::query(
            "UPDATE queue_messages SET locked_until = ?, consumer = NULL WHERE id = ? AND consumer = ?",
        )
        .bind(now_millis().saturating_add(millis(requeue_after)))
        .bind(delivery.delivery_tag)
        .bind(&delivery.consumer)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::LeaseLost(delivery.message.message_id.clone()));
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u64, BrokerError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
