use axum::body::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::aggregation::AggregationError;
use crate::backend::{encode_png, BackendClient, ForwardedHeaders, TensorShape};
use crate::config::ActiveEnsemble;
use crate::types::{
    AggregatedResult, BackendEndpoint, BackendFailure, BackendOutcome, BackendResult, InferenceRequest, PayloadEncoding,
};

pub const TIMESTAMP_HEADER: &str = "Timestamp";

#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("all {attempted} backend calls failed")]
    TransportExhausted { attempted: usize },

    #[error("no backend endpoints configured")]
    NoEndpoints,

    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl EnsembleError {
    pub fn is_insufficient_input(&self) -> bool {
        matches!(self, EnsembleError::Aggregation(AggregationError::InsufficientInput { .. }))
    }
}

/// Sends one request to every configured backend at once and reduces the
/// answers with the active strategy.
pub struct EnsembleCoordinator {
    client: Arc<dyn BackendClient>,
    shape: TensorShape,
}

impl EnsembleCoordinator {
    pub fn new(client: Arc<dyn BackendClient>, shape: TensorShape) -> Self {
        Self { client, shape }
    }

    /// Call every endpoint concurrently and wait for all of them. Endpoints
    /// that need a PNG share one transcode; the raw payload is never touched.
    pub async fn fan_out(&self, request: &InferenceRequest, endpoints: &[BackendEndpoint]) -> Vec<BackendOutcome> {
        let headers = forwarded_headers(request);
        let png = if endpoints.iter().any(|e| e.encoding() == PayloadEncoding::Png) {
            Some(self.transcode(request.payload.clone()).await)
        } else {
            None
        };

        let calls: Vec<_> = endpoints
            .iter()
            .map(|endpoint| {
                let payload = match (endpoint.encoding(), &png) {
                    (PayloadEncoding::Png, Some(png)) => png.clone(),
                    _ => Ok(request.payload.clone()),
                };
                let client = Arc::clone(&self.client);
                let headers = &headers;

                async move {
                    let result = match payload {
                        Ok(bytes) => client.infer(endpoint, bytes, headers).await,
                        Err(reason) => BackendResult::Failure(BackendFailure::Encoding(reason)),
                    };
                    BackendOutcome {
                        endpoint: endpoint.label().to_string(),
                        result,
                    }
                }
            })
            .collect();

        join_all(calls).await
    }

    /// PNG encoding is CPU-bound, so it runs on the blocking pool.
    async fn transcode(&self, raw: Bytes) -> Result<Bytes, String> {
        let shape = self.shape;
        match tokio::task::spawn_blocking(move || encode_png(&raw, shape)).await {
            Ok(encoded) => encoded.map_err(|e| e.to_string()),
            Err(e) => Err(format!("png transcode task failed: {}", e)),
        }
    }

    pub async fn aggregate(
        &self,
        request: &InferenceRequest,
        ensemble: &ActiveEnsemble,
    ) -> Result<AggregatedResult, EnsembleError> {
        let endpoints = ensemble.endpoints();
        if endpoints.is_empty() {
            return Err(EnsembleError::NoEndpoints);
        }

        let outcomes = self.fan_out(request, endpoints).await;

        let mut predictions = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                BackendResult::Success(prediction) => predictions.push(prediction),
                BackendResult::Failure(reason) => {
                    warn!("Backend {} failed for {}: {}", outcome.endpoint, request.request_id, reason);
                }
            }
        }

        if predictions.is_empty() {
            return Err(EnsembleError::TransportExhausted {
                attempted: endpoints.len(),
            });
        }

        debug!(
            "{}/{} backends answered for {}, reducing with {}",
            predictions.len(),
            endpoints.len(),
            request.request_id,
            ensemble.strategy.name()
        );

        let result = ensemble.strategy.reduce(&predictions, &request.request_id)?;
        Ok(result.with_timestamp(request.timestamp))
    }
}

fn forwarded_headers(request: &InferenceRequest) -> ForwardedHeaders {
    let mut headers: ForwardedHeaders = request
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.sort();

    if let Some(timestamp) = request.timestamp {
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case(TIMESTAMP_HEADER)) {
            headers.push((TIMESTAMP_HEADER.to_string(), timestamp.to_string()));
        }
    }
    headers
}
