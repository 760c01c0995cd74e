use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use axum::body::Bytes;

/// Tag marking endpoints that take an encoded image instead of a raw tensor.
pub const LLM_TAG: &str = "llm";

/// How the payload must be shaped for a given endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadEncoding {
    /// Canonical raw RGB tensor bytes, forwarded untouched.
    RawTensor,
    /// PNG container built from the raw tensor.
    Png,
}

impl PayloadEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            PayloadEncoding::RawTensor => "application/octet-stream",
            PayloadEncoding::Png => "image/png",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BackendEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            tag: None,
            name: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Endpoint for a model served under a templated address, e.g.
    /// `http://{model}-service:5012/inference`.
    pub fn for_model(model: &str, url_template: &str) -> Self {
        let lowered = model.to_lowercase();
        let endpoint = Self::new(url_template.replace("{model}", &lowered)).with_name(model);
        if lowered == LLM_TAG {
            endpoint.with_tag(LLM_TAG)
        } else {
            endpoint
        }
    }

    pub fn encoding(&self) -> PayloadEncoding {
        match self.tag.as_deref() {
            Some(tag) if tag.eq_ignore_ascii_case(LLM_TAG) => PayloadEncoding::Png,
            _ => PayloadEncoding::RawTensor,
        }
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

/// One logical request as accepted from upstream preprocessing.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub request_id: String,
    pub payload: Bytes,
    /// Producer timestamp in seconds since the Unix epoch.
    pub timestamp: Option<f64>,
    pub headers: HashMap<String, String>,
}

impl InferenceRequest {
    pub fn new(request_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            payload: payload.into(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<f64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_follows_tag() {
        assert_eq!(BackendEndpoint::new("http://a").encoding(), PayloadEncoding::RawTensor);
        assert_eq!(
            BackendEndpoint::new("http://b").with_tag("LLM").encoding(),
            PayloadEncoding::Png
        );
        assert_eq!(
            BackendEndpoint::new("http://c").with_tag("classifier").encoding(),
            PayloadEncoding::RawTensor
        );
    }

    #[test]
    fn test_for_model_expands_template() {
        let endpoint = BackendEndpoint::for_model("VGG16", "http://{model}-service:5012/inference");
        assert_eq!(endpoint.url, "http://vgg16-service:5012/inference");
        assert_eq!(endpoint.label(), "VGG16");
        assert_eq!(endpoint.encoding(), PayloadEncoding::RawTensor);

        let llm = BackendEndpoint::for_model("LLM", "http://{model}:5012/inference");
        assert_eq!(llm.encoding(), PayloadEncoding::Png);
    }
}
