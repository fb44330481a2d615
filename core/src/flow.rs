use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ThresholdsConfig;

/// Role a node plays in the call topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Entry,
    Internal,
    External,
    Database,
    Messaging,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    Healthy,  // error rate <= 1%, latency within SLA
    Degraded, // error rate in (1%, 5%]
    Failing,  // error rate > 5% or latency above SLA
}

impl NodeHealth {
    pub fn from_metrics(error_rate: f64, avg_latency_us: u64, sla_latency_us: Option<u64>) -> Self {
        let over_sla = sla_latency_us.is_some_and(|sla| avg_latency_us > sla);
        if error_rate > 0.05 || over_sla {
            NodeHealth::Failing
        } else if error_rate > 0.01 {
            NodeHealth::Degraded
        } else {
            NodeHealth::Healthy
        }
    }
}

/// A unique (service, method, endpoint) combination observed in one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: Option<String>,
    pub node_type: NodeType,
    pub health: NodeHealth,
    pub avg_latency_us: u64,
    pub error_rate: f64,
    pub request_count: u64,
    pub span_id: String,
}

/// Placeholder used in node identities when a span carries no HTTP method.
pub const UNKNOWN_METHOD: &str = "unknown";

impl ServiceNode {
    /// Derive a key-safe node identity: `service:method:endpoint` with path
    /// separators replaced and path-parameter braces removed.
    pub fn create_id(service_name: &str, endpoint: &str, method: Option<&str>) -> String {
        format!(
            "{}:{}:{}",
            service_name,
            method.unwrap_or(UNKNOWN_METHOD),
            endpoint
        )
        .replace('/', "_")
        .replace(['{', '}'], "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeStatus {
    Normal,
    Slow,
    Failing,
    Timeout,
    /// Reserved: nothing in the builder currently detects retries.
    Retrying,
}

/// Aggregable latency/error statistics for an edge. Latencies are microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMetrics {
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
    pub error_rate: f64,
    pub request_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl EdgeMetrics {
    /// Metrics for a single observed call.
    pub fn from_single_span(duration_us: u64, is_error: bool, observed_at: DateTime<Utc>) -> Self {
        Self {
            avg_latency_us: duration_us,
            p50_latency_us: duration_us,
            p95_latency_us: duration_us,
            p99_latency_us: duration_us,
            error_rate: if is_error { 1.0 } else { 0.0 },
            request_count: 1,
            failure_count: u64::from(is_error),
            timeout_count: 0,
            last_updated: observed_at,
        }
    }

    /// Combine two bundles. Counts add up exactly; the average is request-weighted
    /// and the percentiles take the maximum of both sides (an approximation, since
    /// neither is recomputable from already-aggregated samples).
    pub fn merge(&self, other: &EdgeMetrics) -> EdgeMetrics {
        let request_count = self.request_count + other.request_count;
        let failure_count = self.failure_count + other.failure_count;

        EdgeMetrics {
            avg_latency_us: weighted_average(
                self.avg_latency_us,
                self.request_count,
                other.avg_latency_us,
                other.request_count,
            ),
            p50_latency_us: self.p50_latency_us.max(other.p50_latency_us),
            p95_latency_us: self.p95_latency_us.max(other.p95_latency_us),
            p99_latency_us: self.p99_latency_us.max(other.p99_latency_us),
            error_rate: if request_count > 0 {
                failure_count as f64 / request_count as f64
            } else {
                0.0
            },
            request_count,
            failure_count,
            timeout_count: self.timeout_count + other.timeout_count,
            last_updated: self.last_updated.max(other.last_updated),
        }
    }

    pub fn avg_latency_ms(&self) -> u64 {
        self.avg_latency_us / 1_000
    }

    pub fn p95_latency_ms(&self) -> u64 {
        self.p95_latency_us / 1_000
    }

    pub fn format_avg_latency(&self) -> String {
        let millis = self.avg_latency_ms();
        if millis < 1_000 {
            format!("{}ms", millis)
        } else {
            format!("{:.2}s", millis as f64 / 1_000.0)
        }
    }

    pub fn format_error_rate(&self) -> String {
        format!("{:.1}%", self.error_rate * 100.0)
    }
}

fn weighted_average(a: u64, wa: u64, b: u64, wb: u64) -> u64 {
    let total = wa + wb;
    if total == 0 {
        return 0;
    }
    ((a as u128 * wa as u128 + b as u128 * wb as u128) / total as u128) as u64
}

/// Directed call between two nodes of a single-trace graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    pub source_service: String,
    pub target_service: String,
    pub metrics: EdgeMetrics,
    pub status: EdgeStatus,
    pub protocol: String,
    pub sample_trace_ids: Vec<String>,
}

impl FlowEdge {
    pub fn create_id(source_node_id: &str, target_node_id: &str) -> String {
        format!("{}->{}", source_node_id, target_node_id)
    }

    /// Classify an edge. Precedence: Timeout > Failing > Slow > Normal.
    pub fn classify(metrics: &EdgeMetrics, thresholds: &ThresholdsConfig) -> EdgeStatus {
        if metrics.timeout_count > 0 {
            EdgeStatus::Timeout
        } else if metrics.error_rate > thresholds.error_rate {
            EdgeStatus::Failing
        } else if metrics.p95_latency_ms() > thresholds.p95_latency_ms {
            EdgeStatus::Slow
        } else {
            EdgeStatus::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowStatus {
    Success,
    PartialFailure,
    Failure,
    /// Reserved: no status rule produces it yet.
    Timeout,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Success => "SUCCESS",
            FlowStatus::PartialFailure => "PARTIAL_FAILURE",
            FlowStatus::Failure => "FAILURE",
            FlowStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "SUCCESS" => Some(FlowStatus::Success),
            "PARTIAL_FAILURE" => Some(FlowStatus::PartialFailure),
            "FAILURE" => Some(FlowStatus::Failure),
            "TIMEOUT" => Some(FlowStatus::Timeout),
            _ => None,
        }
    }
}

/// Reconstruction of one trace as a service call graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiFlowGraph {
    pub trace_id: String,
    pub root_service: String,
    pub root_endpoint: String,
    pub start_time: DateTime<Utc>,
    /// Root span's own duration.
    pub total_duration_us: u64,
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<FlowEdge>,
    pub status: FlowStatus,
    pub span_count: usize,
    pub correlated_incident_ids: Vec<String>,
}

/// Heaviest root-to-leaf chain of calls through a flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallChain {
    pub node_ids: Vec<String>,
    pub total_latency_us: u64,
}

impl ApiFlowGraph {
    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_us / 1_000
    }

    /// Sum of every edge's average latency. Overcounts parallel calls and is
    /// not the trace duration; see [`ApiFlowGraph::total_duration_us`].
    pub fn summed_edge_latency_us(&self) -> u64 {
        self.edges
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.metrics.avg_latency_us))
    }

    pub fn has_failures(&self) -> bool {
        self.nodes.iter().any(|n| n.health == NodeHealth::Failing)
    }

    /// Edge with the highest average latency; the first one wins on ties.
    pub fn slowest_edge(&self) -> Option<&FlowEdge> {
        self.edges.iter().fold(None, |best: Option<&FlowEdge>, edge| match best {
            Some(b) if b.metrics.avg_latency_us >= edge.metrics.avg_latency_us => Some(b),
            _ => Some(edge),
        })
    }

    pub fn node(&self, id: &str) -> Option<&ServiceNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Number of edges leaving the given node.
    pub fn fan_out(&self, node_id: &str) -> usize {
        self.edges
            .iter()
            .filter(|e| e.source_node_id == node_id)
            .count()
    }

    /// Longest path by edge latency. Returns `None` for graphs without edges
    /// or when repeated node identities close a cycle.
    pub fn longest_call_chain(&self) -> Option<CallChain> {
        if self.edges.is_empty() {
            return None;
        }

        let mut graph: DiGraph<&str, u64> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for edge in &self.edges {
            for id in [edge.source_node_id.as_str(), edge.target_node_id.as_str()] {
                index.entry(id).or_insert_with(|| graph.add_node(id));
            }
            graph.add_edge(
                index[edge.source_node_id.as_str()],
                index[edge.target_node_id.as_str()],
                edge.metrics.avg_latency_us,
            );
        }

        let order = toposort(&graph, None).ok()?;

        let mut best: HashMap<NodeIndex, u64> = HashMap::new();
        let mut predecessor: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        for &node in &order {
            let base = best.get(&node).copied().unwrap_or(0);
            for edge in graph.edges(node) {
                let candidate = base.saturating_add(*edge.weight());
                let target = edge.target();
                if best.get(&target).map_or(true, |&current| candidate > current) {
                    best.insert(target, candidate);
                    predecessor.insert(target, node);
                }
            }
        }

        let (&end, &total) = order
            .iter()
            .filter_map(|n| best.get_key_value(n))
            .fold(None, |acc: Option<(&NodeIndex, &u64)>, (n, t)| match acc {
                Some((_, bt)) if bt >= t => acc,
                _ => Some((n, t)),
            })?;

        let mut chain = vec![graph[end].to_string()];
        let mut cursor = end;
        while let Some(&prev) = predecessor.get(&cursor) {
            chain.push(graph[prev].to_string());
            cursor = prev;
        }
        chain.reverse();

        Some(CallChain {
            node_ids: chain,
            total_latency_us: total,
        })
    }
}
