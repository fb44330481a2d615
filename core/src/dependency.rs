//! Cross-trace service dependency aggregation.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::span::Span;

/// Protocol label attached to every aggregated dependency.
pub const DEFAULT_PROTOCOL: &str = "HTTP";

/// Merged statistics for calls from one service to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub source_service: String,
    pub target_service: String,
    pub protocol: String,
    pub request_count: u64,
    pub avg_latency_ms: f64,
    /// Running maximum, used as a p95 proxy.
    pub p95_latency_ms: f64,
    pub error_rate: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ServiceDependency {
    fn seed(source: &str, target: &str, span: &Span) -> Self {
        let latency = span.duration_ms() as f64;
        Self {
            source_service: source.to_string(),
            target_service: target.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            request_count: 1,
            avg_latency_ms: latency,
            p95_latency_ms: latency,
            error_rate: if span.is_error() { 1.0 } else { 0.0 },
            first_seen: span.timestamp,
            last_seen: span.timestamp,
        }
    }

    /// Fold one more observation into the aggregate.
    fn observe(&mut self, span: &Span) {
        let latency = span.duration_ms() as f64;
        let errors = if span.is_error() { 1.0 } else { 0.0 };
        let old_count = self.request_count as f64;
        let new_count = self.request_count + 1;

        self.avg_latency_ms = (self.avg_latency_ms * old_count + latency) / new_count as f64;
        self.p95_latency_ms = self.p95_latency_ms.max(latency);
        self.error_rate = (self.error_rate * old_count + errors) / new_count as f64;
        self.request_count = new_count;
        self.last_seen = self.last_seen.max(span.timestamp);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Sorted by (source, target).
    pub dependencies: Vec<ServiceDependency>,
    /// Every service seen in the batch, sorted.
    pub services: Vec<String>,
    pub computed_at: DateTime<Utc>,
    pub total_traces: usize,
}

impl DependencyGraph {
    pub fn empty() -> Self {
        Self {
            dependencies: Vec::new(),
            services: Vec::new(),
            computed_at: Utc::now(),
            total_traces: 0,
        }
    }

    pub fn get(&self, source: &str, target: &str) -> Option<&ServiceDependency> {
        self.dependencies
            .iter()
            .find(|d| d.source_service == source && d.target_service == target)
    }

    /// Services called by `service`.
    pub fn downstream(&self, service: &str) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.source_service == service)
            .map(|d| d.target_service.as_str())
            .collect()
    }

    /// Services calling `service`.
    pub fn upstream(&self, service: &str) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.target_service == service)
            .map(|d| d.source_service.as_str())
            .collect()
    }

    pub fn fan_out(&self, service: &str) -> usize {
        self.downstream(service).len()
    }

    pub fn fan_in(&self, service: &str) -> usize {
        self.upstream(service).len()
    }
}

/// Folds parent→child service calls from a batch of traces.
#[derive(Debug, Default)]
pub struct DependencyAggregator {
    dependencies: HashMap<(String, String), ServiceDependency>,
    services: BTreeSet<String>,
    traces: usize,
}

impl DependencyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trace(&mut self, spans: &[Span]) {
        self.traces += 1;

        let mut by_id: HashMap<&str, &Span> = HashMap::with_capacity(spans.len());
        for span in spans {
            by_id.entry(span.id.as_str()).or_insert(span);
        }

        for span in spans {
            self.services.insert(span.service_name().to_string());

            let Some(parent) = span.parent().and_then(|p| by_id.get(p)) else {
                continue;
            };
            let source = parent.service_name();
            let target = span.service_name();
            if source == target {
                continue;
            }

            self.dependencies
                .entry((source.to_string(), target.to_string()))
                .and_modify(|dep| dep.observe(span))
                .or_insert_with(|| ServiceDependency::seed(source, target, span));
        }
    }

    pub fn finish(self) -> DependencyGraph {
        let dependencies: Vec<ServiceDependency> = self
            .dependencies
            .into_values()
            .sorted_by(|a, b| {
                (&a.source_service, &a.target_service).cmp(&(&b.source_service, &b.target_service))
            })
            .collect();

        DependencyGraph {
            dependencies,
            services: self.services.into_iter().collect(),
            computed_at: Utc::now(),
            total_traces: self.traces,
        }
    }
}
