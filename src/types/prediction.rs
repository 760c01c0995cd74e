use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single `(class_label, probability)` pair, serialized as `["cat", 0.9]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore(pub String, pub f64);

impl ClassScore {
    pub fn new(label: impl Into<String>, probability: f64) -> Self {
        Self(label.into(), probability)
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn probability(&self) -> f64 {
        self.1
    }
}

pub type Prediction = Vec<ClassScore>;

/// Why a single backend call produced no prediction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendFailure {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("payload encoding failed: {0}")]
    Encoding(String),
}

/// Outcome of one backend call within one fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResult {
    Success(Prediction),
    Failure(BackendFailure),
}

/// A backend result tagged with the endpoint that produced it.
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub endpoint: String,
    pub result: BackendResult,
}

/// The reconciled answer for one request. This is the only entity that
/// leaves the ensemble process: it travels through the durable queue and
/// ends up as a storage row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub request_id: String,
    pub prediction: Prediction,
    /// Producer timestamp in seconds since the Unix epoch.
    #[serde(default, alias = "Timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// Set by the consumer right before persistence.
    #[serde(default, alias = "endtime", alias = "Endtime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl AggregatedResult {
    pub fn new(request_id: impl Into<String>, prediction: Prediction) -> Self {
        Self {
            request_id: request_id.into(),
            prediction,
            timestamp: None,
            end_time: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<f64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Highest-probability class, first one wins on ties.
    pub fn top(&self) -> Option<&ClassScore> {
        self.prediction.iter().fold(None, |best: Option<&ClassScore>, score| match best {
            Some(b) if b.probability() >= score.probability() => Some(b),
            _ => Some(score),
        })
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(epoch_to_utc)
    }

    pub fn end_time_utc(&self) -> Option<DateTime<Utc>> {
        self.end_time.and_then(epoch_to_utc)
    }
}

impl fmt::Display for AggregatedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.request_id)?;
        for (i, score) in self.prediction.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:.4}", score.label(), score.probability())?;
        }
        write!(f, "]")
    }
}

pub fn epoch_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

pub fn utc_to_epoch(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_score_wire_format() {
        let score = ClassScore::new("cat", 0.9);
        assert_eq!(serde_json::to_string(&score).unwrap(), r#"["cat",0.9]"#);

        let parsed: ClassScore = serde_json::from_str(r#"["dog", 0.25]"#).unwrap();
        assert_eq!(parsed.label(), "dog");
        assert_eq!(parsed.probability(), 0.25);
    }

    #[test]
    fn test_aggregated_result_accepts_legacy_field_names() {
        let body = r#"{"request_id":"r-1","prediction":[["cat",0.8]],"Timestamp":1700000000.5,"Endtime":1700000001.0}"#;
        let result: AggregatedResult = serde_json::from_str(body).unwrap();

        assert_eq!(result.timestamp, Some(1700000000.5));
        assert_eq!(result.end_time, Some(1700000001.0));
    }

    #[test]
    fn test_queue_message_omits_unset_end_time() {
        let result = AggregatedResult::new("r-2", vec![ClassScore::new("cat", 0.8)])
            .with_timestamp(Some(10.0));
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["timestamp"], 10.0);
        assert!(json.get("end_time").is_none());
    }

    #[test]
    fn test_top_prefers_first_on_ties() {
        let result = AggregatedResult::new(
            "r-3",
            vec![
                ClassScore::new("cat", 0.4),
                ClassScore::new("dog", 0.6),
                ClassScore::new("fox", 0.6),
            ],
        );
        assert_eq!(result.top().unwrap().label(), "dog");
        assert!(AggregatedResult::new("r-4", Vec::new()).top().is_none());
    }

    #[test]
    fn test_epoch_conversion() {
        let time = epoch_to_utc(1_700_000_000.25).unwrap();
        assert_eq!(time.timestamp_millis(), 1_700_000_000_250);
        assert_eq!(utc_to_epoch(time), 1_700_000_000.25);
        assert!(epoch_to_utc(f64::NAN).is_none());
    }
}
