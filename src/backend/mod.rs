pub mod http;
pub mod payload;

pub use http::*;
pub use payload::*;

use async_trait::async_trait;
use axum::body::Bytes;

use crate::types::{BackendEndpoint, BackendResult};

/// Header name/value pairs passed through to every backend.
pub type ForwardedHeaders = Vec<(String, String)>;

/// One call to one inference endpoint. Implementations never retry and never
/// return an error: every transport or decoding problem becomes
/// `BackendResult::Failure`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn infer(&self, endpoint: &BackendEndpoint, payload: Bytes, headers: &ForwardedHeaders) -> BackendResult;
}
