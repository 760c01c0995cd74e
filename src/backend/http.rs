use async_trait::async_trait;
use axum::body::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{BackendClient, ForwardedHeaders};
use crate::types::{BackendEndpoint, BackendFailure, BackendResult, ClassScore, Prediction};

#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    client: Client,
    timeout: Duration,
}

impl HttpBackendClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn classify(err: reqwest::Error) -> BackendFailure {
    if err.is_timeout() {
        BackendFailure::Timeout
    } else if err.is_connect() {
        BackendFailure::Connect(err.to_string())
    } else {
        BackendFailure::Transport(err.to_string())
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn infer(&self, endpoint: &BackendEndpoint, payload: Bytes, headers: &ForwardedHeaders) -> BackendResult {
        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, endpoint.encoding().content_type());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.body(payload).send().await {
            Ok(response) => response,
            Err(e) => return BackendResult::Failure(classify(e)),
        };

        let status = response.status();
        if !status.is_success() {
            return BackendResult::Failure(BackendFailure::Status(status.as_u16()));
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return BackendResult::Failure(BackendFailure::Timeout),
            Err(e) => return BackendResult::Failure(BackendFailure::InvalidResponse(e.to_string())),
        };

        match normalize_prediction(&body) {
            Ok(prediction) => {
                debug!("{} returned {} classes", endpoint.label(), prediction.len());
                BackendResult::Success(prediction)
            }
            Err(reason) => BackendResult::Failure(BackendFailure::InvalidResponse(reason)),
        }
    }
}

/// Bring the shapes different backends answer with into a `Prediction`.
///
/// Accepted: `{"prediction": [[label, p], ...]}`, `{"prediction": [label, p]}`,
/// a bare `[label, p]` or list of pairs, and `{"response": "text"}` from
/// generative backends, which becomes `[[text, 1.0]]`.
pub fn normalize_prediction(body: &Value) -> Result<Prediction, String> {
    match body {
        Value::Object(map) => {
            if let Some(prediction) = map.get("prediction") {
                parse_prediction(prediction)
            } else if let Some(Value::String(text)) = map.get("response") {
                Ok(vec![ClassScore::new(text.trim(), 1.0)])
            } else {
                Err("body has neither 'prediction' nor 'response'".to_string())
            }
        }
        Value::Array(_) => parse_prediction(body),
        other => Err(format!("unexpected body {}", other)),
    }
}

fn parse_prediction(value: &Value) -> Result<Prediction, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("prediction is not a list: {}", value))?;

    match items.first() {
        None => Ok(Vec::new()),
        Some(Value::Array(_)) => items.iter().map(parse_pair).collect(),
        Some(_) => Ok(vec![parse_pair(value)?]),
    }
}

fn parse_pair(value: &Value) -> Result<ClassScore, String> {
    let pair = match value.as_array() {
        Some(pair) if pair.len() >= 2 => pair,
        _ => return Err(format!("expected [label, probability], got {}", value)),
    };

    let label = match &pair[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(format!("label must be a string, got {}", other)),
    };

    let probability = match &pair[1] {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
    .filter(|p| p.is_finite())
    .ok_or_else(|| format!("probability for '{}' is not a number: {}", label, pair[1]))?;

    Ok(ClassScore::new(label, probability))
}
