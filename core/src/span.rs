use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Service name reported when a span carries no local endpoint.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Network location of a service taking part in a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Endpoint {
    pub service_name: Option<String>,
    pub ipv4: Option<String>,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn named(service_name: impl Into<String>) -> Self {
        Self {
            service_name: Some(service_name.into()),
            ipv4: None,
            port: None,
        }
    }
}

/// Role of a span in an RPC or messaging exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    Client,
    Server,
    Producer,
    Consumer,
    #[default]
    Internal,
}

impl SpanKind {
    /// Parse a backend kind label, case-insensitively. Unknown labels map to `Internal`.
    pub fn parse(label: Option<&str>) -> Self {
        match label.map(|l| l.to_ascii_uppercase()).as_deref() {
            Some("CLIENT") => SpanKind::Client,
            Some("SERVER") => SpanKind::Server,
            Some("PRODUCER") => SpanKind::Producer,
            Some("CONSUMER") => SpanKind::Consumer,
            _ => SpanKind::Internal,
        }
    }
}

/// One recorded unit of work inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub timestamp: DateTime<Utc>,
    pub duration_us: u64,
    pub local_endpoint: Option<Endpoint>,
    pub remote_endpoint: Option<Endpoint>,
    pub tags: HashMap<String, String>,
    /// Error flag derived by the source adapter when the span was decoded
    pub has_error: bool,
}

impl Span {
    /// A span is a root when it has no parent reference, or an empty one.
    pub fn is_root(&self) -> bool {
        self.parent_id.as_deref().map_or(true, str::is_empty)
    }

    /// Parent span id, treating an empty reference as absent.
    pub fn parent(&self) -> Option<&str> {
        self.parent_id.as_deref().filter(|p| !p.is_empty())
    }

    pub fn service_name(&self) -> &str {
        self.local_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
            .unwrap_or(UNKNOWN_SERVICE)
    }

    pub fn remote_service_name(&self) -> Option<&str> {
        self.remote_endpoint
            .as_ref()
            .and_then(|e| e.service_name.as_deref())
    }

    /// Operation name as reported by the instrumentation.
    pub fn endpoint(&self) -> &str {
        &self.name
    }

    pub fn http_method(&self) -> Option<&str> {
        self.tags
            .get("http.method")
            .or_else(|| self.tags.get("method"))
            .map(String::as_str)
    }

    /// HTTP path when tagged, falling back to the full URL and then the operation name.
    pub fn http_path(&self) -> &str {
        self.tags
            .get("http.path")
            .or_else(|| self.tags.get("http.url"))
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    pub fn is_error(&self) -> bool {
        if self.has_error {
            return true;
        }
        let error_tag = self
            .tags
            .get("error")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        error_tag || self.tags.get("http.status_code").is_some_and(|c| c.starts_with('5'))
    }

    /// Duration truncated to whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_us / 1_000
    }

    /// Start plus duration, clamped to the start when the sum is out of range.
    pub fn end_time(&self) -> DateTime<Utc> {
        let micros = i64::try_from(self.duration_us).unwrap_or(i64::MAX);
        self.timestamp
            .checked_add_signed(chrono::Duration::microseconds(micros))
            .unwrap_or(self.timestamp)
    }
}
