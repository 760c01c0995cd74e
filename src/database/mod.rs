use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{AggregatedResult, Prediction};

/// A persisted aggregated result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub id: Uuid,
    pub request_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub prediction_label: Option<String>,
    pub prediction_confidence: Option<f64>,
    pub prediction: Prediction,
    pub end_time: Option<DateTime<Utc>>,
}

/// End-to-end latency (`end_time - timestamp`) over stored results, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub p99: f64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count as f64;
        // nearest-rank percentile
        let rank = ((0.99 * count as f64).ceil() as usize).clamp(1, count);

        Some(Self {
            count,
            mean,
            min: sorted[0],
            max: sorted[count - 1],
            stddev: variance.sqrt(),
            p99: sorted[rank - 1],
        })
    }
}

/// Storage for aggregated results. Writes are idempotent per request: the
/// row id is derived from the request id and the first write wins, so a
/// redelivered queue message leaves the table unchanged.
pub struct ResultStore {
    pool: SqlitePool,
}

impl ResultStore {
    pub async fn new(db_url: &str) -> Result<Self> {
        info!("Opening result store at: {}", db_url);

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                timestamp TEXT,
                prediction_label TEXT,
                prediction_confidence REAL,
                prediction TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_results_end_time ON results(end_time)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Storage key for a request: the request id itself when it is a UUID,
    /// otherwise a name-based UUID of it.
    pub fn result_id(request_id: &str) -> Uuid {
        Uuid::parse_str(request_id).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, request_id.as_bytes()))
    }

    /// Insert the result unless a row for the same request already exists.
    /// Returns whether a row was written.
    pub async fn upsert_result(&self, result: &AggregatedResult) -> Result<bool> {
        let id = Self::result_id(&result.request_id);
        let top = result.top();

        let inserted = sqlx::query(
            r#"
            INSERT INTO results (
                id, request_id, timestamp, prediction_label, prediction_confidence,
                prediction, end_time, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(&result.request_id)
        .bind(result.timestamp_utc().map(format_time))
        .bind(top.map(|s| s.label().to_string()))
        .bind(top.map(|s| s.probability()))
        .bind(serde_json::to_string(&result.prediction)?)
        .bind(result.end_time_utc().map(format_time))
        .bind(format_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        let written = inserted.rows_affected() > 0;
        if !written {
            debug!("Result for {} already stored as {}", result.request_id, id);
        }
        Ok(written)
    }

    pub async fn get_result(&self, request_id: &str) -> Result<Option<StoredResult>> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, timestamp, prediction_label, prediction_confidence, prediction, end_time
            FROM results WHERE id = ?
            "#,
        )
        .bind(Self::result_id(request_id).to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id")?;
        let prediction: String = row.try_get("prediction")?;
        Ok(Some(StoredResult {
            id: Uuid::parse_str(&id)?,
            request_id: row.try_get("request_id")?,
            timestamp: parse_time(row.try_get("timestamp")?)?,
            prediction_label: row.try_get("prediction_label")?,
            prediction_confidence: row.try_get("prediction_confidence")?,
            prediction: serde_json::from_str(&prediction)?,
            end_time: parse_time(row.try_get("end_time")?)?,
        }))
    }

    pub async fn count_results(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count)?)
    }

    pub async fn delete_all(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM results").execute(&self.pool).await?.rows_affected();
        info!("Deleted {} stored results", deleted);
        Ok(deleted)
    }

    /// Latency over the most recently finished results (all when `limit` is
    /// `None`). Rows missing either timestamp are skipped.
    pub async fn latency_summary(&self, limit: Option<u32>) -> Result<Option<LatencySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, end_time FROM results
            WHERE timestamp IS NOT NULL AND end_time IS NOT NULL
            ORDER BY end_time DESC
            LIMIT ?
            "#,
        )
        .bind(limit.map_or(-1, i64::from))
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            let started = parse_time(row.try_get("timestamp")?)?;
            let finished = parse_time(row.try_get("end_time")?)?;
            if let (Some(started), Some(finished)) = (started, finished) {
                samples.push((finished - started).num_milliseconds() as f64 / 1000.0);
            }
        }

        Ok(LatencySummary::from_samples(&samples))
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    // fixed width so text order matches time order
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| Ok(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)))
        .transpose()
}
