//! Summarizer and embedder collaborator capabilities
//!
//! Both are narrow black boxes with null implementations; the core never
//! assumes either service is configured or reachable.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Hard deadline for a summarizer call; on expiry the caller falls back to
/// verbatim passthrough.
pub const SUMMARIZER_DEADLINE: Duration = Duration::from_secs(5);

/// `(text) -> text` collaborator.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `None` means unavailable or failed; the caller uses the input
    /// verbatim.
    async fn summarize(&self, text: &str) -> Option<String>;
}

/// `(text) -> vector` collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Null implementation used when no endpoint is configured.
pub struct Passthrough;

#[async_trait]
impl Summarizer for Passthrough {
    async fn summarize(&self, _text: &str) -> Option<String> {
        None
    }
}

#[async_trait]
impl Embedder for Passthrough {
    async fn embed(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

/// HTTP-backed summarizer.
pub struct HttpSummarizer {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSummarizer {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str) -> Option<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(SUMMARIZER_DEADLINE)
            .json(&json!({ "text": text }))
            .send()
            .await
            .ok()?;
        let body: serde_json::Value = response.json().await.ok()?;
        body.get("summary")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }
}

/// HTTP-backed embedder.
pub struct HttpEmbedder {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(SUMMARIZER_DEADLINE)
            .json(&json!({ "text": text }))
            .send()
            .await
            .ok()?;
        let body: serde_json::Value = response.json().await.ok()?;
        let values = body.get("embedding")?.as_array()?;
        Some(
            values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect(),
        )
    }
}

/// Build the summarizer from configuration.
pub fn summarizer_from(endpoint: Option<&str>) -> Arc<dyn Summarizer> {
    match endpoint {
        Some(url) => Arc::new(HttpSummarizer::new(url.to_string())),
        None => Arc::new(Passthrough),
    }
}

/// Build the embedder from configuration.
pub fn embedder_from(endpoint: Option<&str>) -> Arc<dyn Embedder> {
    match endpoint {
        Some(url) => Arc::new(HttpEmbedder::new(url.to_string())),
        None => Arc::new(Passthrough),
    }
}
