use std::collections::{HashMap, HashSet};

use crate::classify::NodeClassifier;
use crate::config::{Config, ThresholdsConfig};
use crate::dependency::{DependencyAggregator, DependencyGraph, DEFAULT_PROTOCOL};
use crate::flow::{
    ApiFlowGraph, EdgeMetrics, FlowEdge, FlowStatus, NodeHealth, ServiceNode,
};
use crate::span::Span;

/// Maximum number of trace ids kept on an aggregated edge.
pub const MAX_SAMPLE_TRACE_IDS: usize = 5;

/// Rebuilds service call graphs from flat span collections.
///
/// The builder holds only configuration; every method is a pure function of
/// its input and can be shared freely across tasks.
#[derive(Debug, Clone)]
pub struct FlowGraphBuilder {
    thresholds: ThresholdsConfig,
    classifier: NodeClassifier,
}

impl FlowGraphBuilder {
    pub fn new(thresholds: ThresholdsConfig, classifier: NodeClassifier) -> Self {
        Self {
            thresholds,
            classifier,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let classifier = match &config.classification.rules {
            Some(rules) => NodeClassifier::new(rules.clone()),
            None => NodeClassifier::default(),
        };
        Self::new(config.thresholds.clone(), classifier)
    }

    pub fn thresholds(&self) -> &ThresholdsConfig {
        &self.thresholds
    }

    /// Build the call graph of one trace. Returns `None` for an empty span list.
    pub fn build_from_trace(&self, spans: &[Span]) -> Option<ApiFlowGraph> {
        let first = spans.first()?;

        // first-seen wins on duplicate span ids
        let mut by_id: HashMap<&str, &Span> = HashMap::with_capacity(spans.len());
        for span in spans {
            by_id.entry(span.id.as_str()).or_insert(span);
        }

        let root = spans.iter().find(|s| s.is_root()).unwrap_or(first);

        let mut nodes: Vec<ServiceNode> = Vec::new();
        let mut node_ids: HashSet<String> = HashSet::new();
        for span in spans {
            let id = node_id(span);
            if node_ids.insert(id.clone()) {
                nodes.push(self.create_node(span, id, std::ptr::eq(span, root)));
            }
        }

        let mut edges: Vec<FlowEdge> = Vec::new();
        let mut edge_ids: HashSet<String> = HashSet::new();
        for span in spans {
            let Some(parent) = span.parent().and_then(|p| by_id.get(p)) else {
                continue;
            };
            let source = node_id(parent);
            let target = node_id(span);
            if source == target {
                continue;
            }
            let edge_id = FlowEdge::create_id(&source, &target);
            if edge_ids.insert(edge_id) {
                edges.push(self.create_edge(parent, span, source, target));
            }
        }

        tracing::debug!(
            trace_id = %first.trace_id,
            nodes = nodes.len(),
            edges = edges.len(),
            "Built flow graph"
        );

        Some(ApiFlowGraph {
            trace_id: first.trace_id.clone(),
            root_service: root.service_name().to_string(),
            root_endpoint: root.endpoint().to_string(),
            start_time: root.timestamp,
            total_duration_us: root.duration_us,
            nodes,
            edges,
            status: determine_status(spans),
            span_count: spans.len(),
            correlated_incident_ids: Vec::new(),
        })
    }

    /// Aggregate service-to-service calls across a batch of traces.
    pub fn build_dependency_graph(&self, traces: &[Vec<Span>]) -> DependencyGraph {
        let mut aggregator = DependencyAggregator::new();
        for trace in traces {
            aggregator.add_trace(trace);
        }
        aggregator.finish()
    }

    /// Merge edges sharing an identity across several flow graphs.
    ///
    /// Output order follows first appearance. Status is recomputed from the
    /// merged metrics and sample trace ids are capped.
    pub fn aggregate_edges(&self, graphs: &[ApiFlowGraph]) -> Vec<FlowEdge> {
        let mut merged: Vec<FlowEdge> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();

        for edge in graphs.iter().flat_map(|g| g.edges.iter()) {
            match position.get(&edge.id) {
                Some(&idx) => {
                    let existing = &mut merged[idx];
                    existing.metrics = existing.metrics.merge(&edge.metrics);
                    for trace_id in &edge.sample_trace_ids {
                        if existing.sample_trace_ids.len() >= MAX_SAMPLE_TRACE_IDS {
                            break;
                        }
                        if !existing.sample_trace_ids.contains(trace_id) {
                            existing.sample_trace_ids.push(trace_id.clone());
                        }
                    }
                }
                None => {
                    position.insert(edge.id.clone(), merged.len());
                    let mut edge = edge.clone();
                    edge.sample_trace_ids.truncate(MAX_SAMPLE_TRACE_IDS);
                    merged.push(edge);
                }
            }
        }

        for edge in &mut merged {
            edge.status = FlowEdge::classify(&edge.metrics, &self.thresholds);
        }
        merged
    }

    fn create_node(&self, span: &Span, id: String, is_root: bool) -> ServiceNode {
        let error_rate = if span.is_error() { 1.0 } else { 0.0 };
        let sla_us = self.thresholds.sla_latency_ms.saturating_mul(1_000);

        ServiceNode {
            id,
            service_name: span.service_name().to_string(),
            endpoint: span.http_path().to_string(),
            method: span.http_method().map(str::to_string),
            node_type: self
                .classifier
                .classify(span.service_name(), span.endpoint(), is_root),
            health: NodeHealth::from_metrics(error_rate, span.duration_us, Some(sla_us)),
            avg_latency_us: span.duration_us,
            error_rate,
            request_count: 1,
            span_id: span.id.clone(),
        }
    }

    fn create_edge(&self, parent: &Span, child: &Span, source: String, target: String) -> FlowEdge {
        let metrics =
            EdgeMetrics::from_single_span(child.duration_us, child.is_error(), child.end_time());

        FlowEdge {
            id: FlowEdge::create_id(&source, &target),
            source_node_id: source,
            target_node_id: target,
            source_service: parent.service_name().to_string(),
            target_service: child.service_name().to_string(),
            status: FlowEdge::classify(&metrics, &self.thresholds),
            metrics,
            protocol: DEFAULT_PROTOCOL.to_string(),
            sample_trace_ids: vec![child.trace_id.clone()],
        }
    }
}

impl Default for FlowGraphBuilder {
    fn default() -> Self {
        Self::new(ThresholdsConfig::default(), NodeClassifier::default())
    }
}

fn node_id(span: &Span) -> String {
    ServiceNode::create_id(span.service_name(), span.endpoint(), span.http_method())
}

fn determine_status(spans: &[Span]) -> FlowStatus {
    let errors = spans.iter().filter(|s| s.is_error()).count();
    if errors == 0 {
        FlowStatus::Success
    } else if errors == spans.len() {
        FlowStatus::Failure
    } else {
        FlowStatus::PartialFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{EdgeStatus, NodeType};
    use crate::span::{Endpoint, SpanKind};
    use chrono::{TimeZone, Utc};

    fn span(id: &str, parent: Option<&str>, service: &str, name: &str, ms: u64, error: bool) -> Span {
        Span {
            trace_id: "trace-1".into(),
            id: id.into(),
            parent_id: parent.map(Into::into),
            name: name.into(),
            kind: SpanKind::Server,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            duration_us: ms * 1_000,
            local_endpoint: Some(Endpoint::named(service)),
            remote_endpoint: None,
            tags: HashMap::new(),
            has_error: error,
        }
    }

    fn three_span_trace() -> Vec<Span> {
        vec![
            span("a", None, "A", "get /checkout", 10, false),
            span("b", Some("a"), "B", "post /orders", 600, false),
            span("c", Some("b"), "C", "charge", 50, true),
        ]
    }

    #[test]
    fn empty_trace_has_no_graph() {
        assert!(FlowGraphBuilder::default().build_from_trace(&[]).is_none());
    }

    #[test]
    fn three_span_scenario() {
        let graph = FlowGraphBuilder::default()
            .build_from_trace(&three_span_trace())
            .unwrap();

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.status, FlowStatus::PartialFailure);
        assert_eq!(graph.root_service, "A");
        assert_eq!(graph.root_endpoint, "get /checkout");
        assert_eq!(graph.total_duration_ms(), 10);
        assert_eq!(graph.span_count, 3);
        assert_eq!(graph.nodes[0].node_type, NodeType::Entry);

        let ab = &graph.edges[0];
        assert_eq!((ab.source_service.as_str(), ab.target_service.as_str()), ("A", "B"));
        assert_eq!(ab.status, EdgeStatus::Slow);
        assert_eq!(ab.metrics.p95_latency_ms(), 600);

        let bc = &graph.edges[1];
        assert_eq!(bc.status, EdgeStatus::Failing);
        assert_eq!(bc.metrics.error_rate, 1.0);
        assert_eq!(bc.sample_trace_ids, vec!["trace-1"]);
    }

    #[test]
    fn repeated_identity_keeps_first_node_and_one_edge() {
        let spans = vec![
            span("r", None, "gateway", "get /", 20, false),
            span("x", Some("r"), "users", "get /users/{id}", 5, false),
            span("y", Some("r"), "users", "get /users/{id}", 900, true),
            // same node on both ends
            span("z", Some("x"), "users", "get /users/{id}", 1, false),
        ];
        let graph = FlowGraphBuilder::default().build_from_trace(&spans).unwrap();

        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        let users = &graph.nodes[1];
        assert_eq!(users.span_id, "x");
        assert_eq!(users.error_rate, 0.0);
        assert_eq!(graph.edges[0].metrics.avg_latency_ms(), 5);
    }

    #[test]
    fn duplicate_span_id_keeps_first_seen() {
        let spans = vec![
            span("a", None, "A", "get /", 10, false),
            span("a", None, "X", "get /other", 10, false),
            span("b", Some("a"), "B", "get /b", 20, false),
        ];
        let graph = FlowGraphBuilder::default().build_from_trace(&spans).unwrap();

        assert_eq!(graph.root_service, "A");
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].source_service, "A");
        assert_eq!(graph.edges[0].target_service, "B");
    }

    #[test]
    fn absurd_parsed_duration_does_not_break_the_build() {
        let body = serde_json::json!([
            {"traceId": "t", "id": "a", "name": "get /", "timestamp": 1_714_550_400_000_000u64,
             "duration": 1_000, "localEndpoint": {"serviceName": "A"}},
            {"traceId": "t", "id": "b", "parentId": "a", "name": "get /b",
             "timestamp": 1_714_550_400_000_100u64, "duration": 9_000_000_000_000_000_000u64,
             "localEndpoint": {"serviceName": "B"}}
        ]);
        let spans = crate::source::parse_spans(&body);
        assert_eq!(spans.len(), 2);

        let graph = FlowGraphBuilder::default().build_from_trace(&spans).unwrap();
        let edge = &graph.edges[0];
        assert_eq!(edge.metrics.last_updated, spans[1].timestamp);
        assert_eq!(edge.status, EdgeStatus::Slow);
        assert!(graph.longest_call_chain().is_some());
        assert_eq!(graph.summed_edge_latency_us(), 9_000_000_000_000_000_000);
    }

    #[test]
    fn missing_parent_is_treated_as_root_candidate_without_edge() {
        let spans = vec![
            span("b", Some("gone"), "B", "work", 30, false),
            span("c", Some("b"), "C", "query database", 10, false),
        ];
        let graph = FlowGraphBuilder::default().build_from_trace(&spans).unwrap();

        // no span is a root, so the first one stands in
        assert_eq!(graph.root_service, "B");
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.nodes[1].node_type, NodeType::Database);
    }

    #[test]
    fn status_all_failed() {
        let spans = vec![
            span("a", None, "A", "x", 1, true),
            span("b", Some("a"), "B", "y", 1, true),
        ];
        let graph = FlowGraphBuilder::default().build_from_trace(&spans).unwrap();
        assert_eq!(graph.status, FlowStatus::Failure);
    }

    #[test]
    fn build_is_deterministic() {
        let builder = FlowGraphBuilder::default();
        let spans = three_span_trace();
        assert_eq!(builder.build_from_trace(&spans), builder.build_from_trace(&spans));
    }

    #[test]
    fn node_health_uses_sla() {
        let graph = FlowGraphBuilder::default()
            .build_from_trace(&three_span_trace())
            .unwrap();
        assert_eq!(graph.nodes[0].health, NodeHealth::Healthy);
        assert_eq!(graph.nodes[1].health, NodeHealth::Failing);
        assert_eq!(graph.nodes[2].health, NodeHealth::Failing);
        assert!(graph.has_failures());
    }

    #[test]
    fn aggregate_edges_merges_by_identity() {
        let builder = FlowGraphBuilder::default();
        let mut graphs = Vec::new();
        for (i, ms) in [100, 300, 200, 100, 100, 100].iter().enumerate() {
            let mut spans = vec![
                span("a", None, "A", "get /", 10, false),
                span("b", Some("a"), "B", "get /b", *ms, i == 0),
            ];
            for s in &mut spans {
                s.trace_id = format!("t{i}");
            }
            graphs.push(builder.build_from_trace(&spans).unwrap());
        }

        let edges = builder.aggregate_edges(&graphs);
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.metrics.request_count, 6);
        assert_eq!(edge.metrics.failure_count, 1);
        assert_eq!(edge.metrics.p95_latency_ms(), 300);
        assert_eq!(edge.sample_trace_ids.len(), MAX_SAMPLE_TRACE_IDS);
        assert_eq!(edge.sample_trace_ids[0], "t0");
        // 1 failure in 6 calls is above the 5% threshold
        assert_eq!(edge.status, EdgeStatus::Failing);
    }
}
