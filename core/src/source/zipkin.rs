use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use reqwest::Url;

use super::source_trait::{BackendDependencyLink, SourceError, TraceSource};
use crate::config::ZipkinConfig;
use crate::span::{Endpoint, Span, SpanKind, UNKNOWN_SERVICE};

/// Client for the Zipkin v2 query API.
pub struct ZipkinClient {
    client: reqwest::Client,
    base_url: Url,
    default_limit: usize,
    default_lookback: Duration,
}

impl ZipkinClient {
    pub fn new(config: &ZipkinConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::InvalidUrl(config.base_url.clone()));
        }

        tracing::debug!(base_url = %base_url, "Zipkin client initialized");

        Ok(Self {
            client,
            base_url,
            default_limit: config.default_limit,
            default_lookback: config.default_lookback(),
        })
    }

    /// Base URL with the given path segments appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<Value, SourceError> {
        let url = self.endpoint(segments)?;
        let path = url.path().to_string();
        let response = self.client.get(url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                path,
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn limit(&self, limit: usize) -> usize {
        if limit > 0 {
            limit
        } else {
            self.default_limit
        }
    }

    fn lookback_ms(&self, lookback: Duration) -> u128 {
        if lookback.is_zero() {
            self.default_lookback.as_millis()
        } else {
            lookback.as_millis()
        }
    }
}

#[async_trait]
impl TraceSource for ZipkinClient {
    async fn services(&self) -> Result<Vec<String>, SourceError> {
        let body = self.get_json(&["api", "v2", "services"], &[]).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn trace(&self, trace_id: &str) -> Result<Vec<Span>, SourceError> {
        let body = self
            .get_json(&["api", "v2", "trace", trace_id], &[])
            .await?;
        Ok(parse_spans(&body))
    }

    async fn recent_traces(
        &self,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError> {
        let body = self
            .get_json(
                &["api", "v2", "traces"],
                &[
                    ("limit", self.limit(limit).to_string()),
                    ("endTs", end_ts().to_string()),
                    ("lookback", self.lookback_ms(lookback).to_string()),
                ],
            )
            .await?;
        Ok(parse_traces(&body))
    }

    async fn traces_for_service(
        &self,
        service_name: &str,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError> {
        let body = self
            .get_json(
                &["api", "v2", "traces"],
                &[
                    ("serviceName", service_name.to_string()),
                    ("limit", self.limit(limit).to_string()),
                    ("endTs", end_ts().to_string()),
                    ("lookback", self.lookback_ms(lookback).to_string()),
                ],
            )
            .await?;
        Ok(parse_traces(&body))
    }

    async fn span_names(&self, service_name: &str) -> Result<Vec<String>, SourceError> {
        let body = self
            .get_json(
                &["api", "v2", "spans"],
                &[("serviceName", service_name.to_string())],
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn backend_dependencies(
        &self,
        lookback: Duration,
    ) -> Result<Vec<BackendDependencyLink>, SourceError> {
        let body = self
            .get_json(
                &["api", "v2", "dependencies"],
                &[
                    ("endTs", end_ts().to_string()),
                    ("lookback", self.lookback_ms(lookback).to_string()),
                ],
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }
}

fn end_ts() -> i64 {
    Utc::now().timestamp_millis()
}

// Wire format ---------------------------------------------------------------

/// Parse a list of traces (array of span arrays).
pub fn parse_traces(body: &Value) -> Vec<Vec<Span>> {
    match body.as_array() {
        Some(traces) => traces.iter().map(parse_spans).collect(),
        None => Vec::new(),
    }
}

/// Parse one trace, skipping spans that cannot be decoded.
pub fn parse_spans(body: &Value) -> Vec<Span> {
    let Some(nodes) = body.as_array() else {
        return Vec::new();
    };

    nodes
        .iter()
        .filter_map(|node| match parse_span(node) {
            Ok(span) => Some(span),
            Err(e) => {
                tracing::warn!("Skipping span {}: {}", node, e);
                None
            }
        })
        .collect()
}

pub fn parse_span(node: &Value) -> Result<Span, SourceError> {
    if !node.is_object() {
        return Err(SourceError::MalformedSpan("expected a JSON object".into()));
    }

    let trace_id = required_str(node, "traceId")?;
    let id = required_str(node, "id")?;
    let parent_id = node
        .get("parentId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let name = node
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let kind = SpanKind::parse(node.get("kind").and_then(Value::as_str));

    // microseconds since epoch; missing means "now"
    let timestamp = match optional_u64(node, "timestamp")? {
        Some(micros) if micros > 0 => micros_to_datetime(micros)?,
        _ => Utc::now(),
    };
    let duration_us = optional_u64(node, "duration")?.unwrap_or(0);

    let local_endpoint = node
        .get("localEndpoint")
        .filter(|v| v.is_object())
        .map(|v| parse_endpoint(v, Some(UNKNOWN_SERVICE)));
    let remote_endpoint = node
        .get("remoteEndpoint")
        .filter(|v| v.is_object())
        .map(|v| parse_endpoint(v, None));

    let tags: HashMap<String, String> = node
        .get("tags")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let has_error = tags.contains_key("error")
        || tags
            .get("http.status_code")
            .is_some_and(|code| code.starts_with('5'));

    Ok(Span {
        trace_id,
        id,
        parent_id,
        name,
        kind,
        timestamp,
        duration_us,
        local_endpoint,
        remote_endpoint,
        tags,
        has_error,
    })
}

fn required_str(node: &Value, field: &str) -> Result<String, SourceError> {
    node.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SourceError::MalformedSpan(format!("missing {}", field)))
}

fn optional_u64(node: &Value, field: &str) -> Result<Option<u64>, SourceError> {
    match node.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| SourceError::MalformedSpan(format!("{} is not an unsigned integer", field))),
    }
}

fn micros_to_datetime(micros: u64) -> Result<DateTime<Utc>, SourceError> {
    let secs = (micros / 1_000_000) as i64;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| SourceError::MalformedSpan(format!("timestamp {} out of range", micros)))
}

fn parse_endpoint(node: &Value, default_service: Option<&str>) -> Endpoint {
    Endpoint {
        service_name: node
            .get("serviceName")
            .and_then(Value::as_str)
            .or(default_service)
            .map(str::to_string),
        ipv4: node.get("ipv4").and_then(Value::as_str).map(str::to_string),
        port: node
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok()),
    }
}
