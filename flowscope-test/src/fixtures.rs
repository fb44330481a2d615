use chrono::{DateTime, Duration, Utc};
use flowscope_core::{Endpoint, Span, SpanKind};
use std::collections::HashMap;

/// Fluent builder for hand-written spans.
#[derive(Debug, Clone)]
pub struct SpanFixture {
    span: Span,
}

impl SpanFixture {
    pub fn new(trace_id: &str, id: &str, service: &str) -> Self {
        Self {
            span: Span {
                trace_id: trace_id.to_string(),
                id: id.to_string(),
                parent_id: None,
                name: format!("{service} handler"),
                kind: SpanKind::Server,
                timestamp: base_time(),
                duration_us: 1_000,
                local_endpoint: Some(Endpoint::named(service)),
                remote_endpoint: None,
                tags: HashMap::new(),
                has_error: false,
            },
        }
    }

    pub fn child_of(mut self, parent_id: &str) -> Self {
        self.span.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.span.name = name.to_string();
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.span.duration_us = ms * 1_000;
        self
    }

    /// Start `offset_ms` after the fixture base time.
    pub fn offset_ms(mut self, offset_ms: i64) -> Self {
        self.span.timestamp = base_time() + Duration::milliseconds(offset_ms);
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.span.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn http(self, method: &str, path: &str) -> Self {
        self.tag("http.method", method).tag("http.path", path)
    }

    pub fn error(mut self) -> Self {
        self.span.has_error = true;
        self.tag("error", "true")
    }

    pub fn build(self) -> Span {
        self.span
    }
}

/// Shared start time for fixtures, a minute in the past so every lookback
/// window used by the tests contains it.
pub fn base_time() -> DateTime<Utc> {
    use std::sync::OnceLock;
    static BASE: OnceLock<DateTime<Utc>> = OnceLock::new();
    *BASE.get_or_init(|| Utc::now() - Duration::minutes(1))
}

/// gateway (10ms) → orders (600ms) → payments (50ms, errored).
pub fn checkout_trace(trace_id: &str) -> Vec<Span> {
    vec![
        SpanFixture::new(trace_id, "root", "gateway")
            .http("GET", "/checkout")
            .duration_ms(10)
            .build(),
        SpanFixture::new(trace_id, "child", "orders")
            .child_of("root")
            .http("POST", "/orders")
            .duration_ms(600)
            .offset_ms(1)
            .build(),
        SpanFixture::new(trace_id, "grandchild", "payments")
            .child_of("child")
            .http("POST", "/charge")
            .duration_ms(50)
            .offset_ms(2)
            .error()
            .build(),
    ]
}

/// Two-hop trace where every call is fast and clean.
pub fn healthy_trace(trace_id: &str, offset_ms: i64) -> Vec<Span> {
    vec![
        SpanFixture::new(trace_id, "root", "gateway")
            .http("GET", "/health")
            .duration_ms(15)
            .offset_ms(offset_ms)
            .build(),
        SpanFixture::new(trace_id, "child", "inventory")
            .child_of("root")
            .http("GET", "/stock")
            .duration_ms(12)
            .offset_ms(offset_ms + 1)
            .build(),
    ]
}

/// Two traces with a single A→B call of 100ms and 300ms.
pub fn dependency_traces() -> Vec<Vec<Span>> {
    [("dep-1", 100, 0), ("dep-2", 300, 5)]
        .into_iter()
        .map(|(trace_id, ms, offset)| {
            vec![
                SpanFixture::new(trace_id, "a", "A")
                    .duration_ms(ms + 10)
                    .offset_ms(offset)
                    .build(),
                SpanFixture::new(trace_id, "b", "B")
                    .child_of("a")
                    .duration_ms(ms)
                    .offset_ms(offset + 1)
                    .build(),
            ]
        })
        .collect()
}

/// Root that calls `width` distinct downstream services.
pub fn fan_out_trace(trace_id: &str, width: usize) -> Vec<Span> {
    let mut spans = vec![SpanFixture::new(trace_id, "root", "aggregator")
        .http("GET", "/dashboard")
        .duration_ms(40)
        .build()];
    for i in 0..width {
        spans.push(
            SpanFixture::new(trace_id, &format!("leaf-{i}"), &format!("backend-{i}"))
                .child_of("root")
                .duration_ms(20)
                .offset_ms(1)
                .build(),
        );
    }
    spans
}

/// Zipkin v2 payload for one trace, including a span without an id.
pub fn zipkin_trace_json(trace_id: &str) -> String {
    let micros = base_time().timestamp_micros();
    serde_json::json!([
        {
            "traceId": trace_id,
            "id": "root",
            "name": "get /checkout",
            "kind": "SERVER",
            "timestamp": micros,
            "duration": 10_000,
            "localEndpoint": { "serviceName": "gateway" },
            "tags": { "http.method": "GET", "http.path": "/checkout" }
        },
        {
            "traceId": trace_id,
            "id": "child",
            "parentId": "root",
            "name": "post /orders",
            "kind": "SERVER",
            "timestamp": micros + 1_000,
            "duration": 600_000,
            "localEndpoint": { "serviceName": "orders" },
            "tags": { "http.method": "POST", "http.path": "/orders", "http.status_code": "503" }
        },
        {
            "traceId": trace_id,
            "name": "broken"
        }
    ])
    .to_string()
}
