use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::span::Span;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Trace backend transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Trace backend returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("Failed to decode trace backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Malformed span: {0}")]
    MalformedSpan(String),

    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid trace backend URL: {0}")]
    InvalidUrl(String),
}

/// One aggregated service link as reported by the backend itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDependencyLink {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub call_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

/// Source of raw spans, typically a tracing backend's query API.
///
/// Implementations report failures through `Result`. Callers that must
/// degrade instead of failing use the `fetch_*` methods, which log the error
/// and return an empty collection.
#[async_trait]
pub trait TraceSource: Send + Sync {
    // Contract ------------------------------------------------------------

    async fn services(&self) -> Result<Vec<String>, SourceError>;

    async fn trace(&self, trace_id: &str) -> Result<Vec<Span>, SourceError>;

    async fn recent_traces(
        &self,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError>;

    async fn traces_for_service(
        &self,
        service_name: &str,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError>;

    // Backend extras -------------------------------------------------------

    /// Operation names recorded for a service.
    async fn span_names(&self, service_name: &str) -> Result<Vec<String>, SourceError>;

    /// The backend's own aggregated service links for a lookback window.
    async fn backend_dependencies(
        &self,
        lookback: Duration,
    ) -> Result<Vec<BackendDependencyLink>, SourceError>;

    // Degrading wrappers ---------------------------------------------------

    async fn list_services(&self) -> Vec<String> {
        self.services().await.unwrap_or_else(|e| {
            tracing::error!("Failed to fetch services: {}", e);
            Vec::new()
        })
    }

    async fn fetch_trace(&self, trace_id: &str) -> Vec<Span> {
        self.trace(trace_id).await.unwrap_or_else(|e| {
            tracing::error!("Failed to fetch trace {}: {}", trace_id, e);
            Vec::new()
        })
    }

    async fn fetch_recent_traces(&self, limit: usize, lookback: Duration) -> Vec<Vec<Span>> {
        self.recent_traces(limit, lookback)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to fetch recent traces: {}", e);
                Vec::new()
            })
    }

    async fn fetch_span_names(&self, service_name: &str) -> Vec<String> {
        self.span_names(service_name).await.unwrap_or_else(|e| {
            tracing::error!("Failed to fetch span names for {}: {}", service_name, e);
            Vec::new()
        })
    }

    async fn fetch_backend_dependencies(&self, lookback: Duration) -> Vec<BackendDependencyLink> {
        self.backend_dependencies(lookback)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to fetch backend dependencies: {}", e);
                Vec::new()
            })
    }

    async fn fetch_traces_for_service(
        &self,
        service_name: &str,
        limit: usize,
        lookback: Duration,
    ) -> Vec<Vec<Span>> {
        self.traces_for_service(service_name, limit, lookback)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to fetch traces for service {}: {}", service_name, e);
                Vec::new()
            })
    }
}
