//! Rule-based bottleneck detection over a single flow graph.

use serde::{Deserialize, Serialize};

use crate::config::DetectionConfig;
use crate::flow::ApiFlowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottleneckType {
    HighErrorRate,
    HighLatency,
    CriticalLatency,
    RelativeSlowness,
    Timeout,
    HighFanOut,
    /// Reserved: no rule emits it yet.
    CascadingFailure,
}

/// Severity of a finding. Variants are declared in ascending order so the
/// derived `Ord` ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Escalate a ratio against its threshold.
pub fn calculate_severity(value: f64, threshold: f64, critical_threshold: f64) -> Severity {
    if value >= critical_threshold {
        Severity::Critical
    } else if value >= threshold * 2.0 {
        Severity::High
    } else if value >= threshold {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    /// Edge id or node id the finding is about.
    pub element_id: String,
    pub service_name: String,
    pub bottleneck_type: BottleneckType,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct BottleneckDetector {
    config: DetectionConfig,
}

impl BottleneckDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Evaluate every rule. Findings come out in emission order: edge rules in
    /// edge order, then fan-out per node in node order.
    pub fn detect(&self, graph: &ApiFlowGraph) -> Vec<Bottleneck> {
        let cfg = &self.config;
        let mut findings = Vec::new();

        let mean_latency_ms = if graph.edges.is_empty() {
            0.0
        } else {
            graph
                .edges
                .iter()
                .map(|e| e.metrics.avg_latency_ms() as f64)
                .sum::<f64>()
                / graph.edges.len() as f64
        };

        for edge in &graph.edges {
            let metrics = &edge.metrics;
            let latency_ms = metrics.avg_latency_ms();
            let mut push = |bottleneck_type, severity, description: String| {
                findings.push(Bottleneck {
                    element_id: edge.id.clone(),
                    service_name: edge.target_service.clone(),
                    bottleneck_type,
                    severity,
                    description,
                });
            };

            if metrics.error_rate > cfg.error_rate {
                push(
                    BottleneckType::HighErrorRate,
                    calculate_severity(metrics.error_rate, cfg.error_rate, cfg.critical_error_rate),
                    format!(
                        "Error rate {:.1}% exceeds threshold ({:.1}%)",
                        metrics.error_rate * 100.0,
                        cfg.error_rate * 100.0
                    ),
                );
            }

            if latency_ms > cfg.critical_latency_ms {
                push(
                    BottleneckType::CriticalLatency,
                    Severity::Critical,
                    format!(
                        "Latency {}ms is critically high (>{}ms)",
                        latency_ms, cfg.critical_latency_ms
                    ),
                );
            } else if latency_ms > cfg.high_latency_ms {
                push(
                    BottleneckType::HighLatency,
                    Severity::High,
                    format!(
                        "Latency {}ms exceeds threshold ({}ms)",
                        latency_ms, cfg.high_latency_ms
                    ),
                );
            }

            let latency = latency_ms as f64;
            if mean_latency_ms > 0.0 && latency > mean_latency_ms * cfg.relative_latency_multiplier {
                push(
                    BottleneckType::RelativeSlowness,
                    Severity::Medium,
                    format!(
                        "Latency {}ms is {:.1}x slower than average ({:.0}ms)",
                        latency_ms,
                        latency / mean_latency_ms,
                        mean_latency_ms
                    ),
                );
            }

            if metrics.timeout_count > 0 {
                push(
                    BottleneckType::Timeout,
                    Severity::Critical,
                    format!("{} timeout(s) detected", metrics.timeout_count),
                );
            }
        }

        for node in &graph.nodes {
            let fan_out = graph.fan_out(&node.id);
            if fan_out > cfg.fan_out_medium {
                findings.push(Bottleneck {
                    element_id: node.id.clone(),
                    service_name: node.service_name.clone(),
                    bottleneck_type: BottleneckType::HighFanOut,
                    severity: if fan_out > cfg.fan_out_high {
                        Severity::High
                    } else {
                        Severity::Medium
                    },
                    description: format!("High fan-out: {} downstream calls", fan_out),
                });
            }
        }

        findings
    }

    /// Most severe finding; the earliest one wins on ties.
    pub fn find_primary(&self, graph: &ApiFlowGraph) -> Option<Bottleneck> {
        primary(self.detect(graph))
    }
}

/// Pick the most severe finding from an already-detected list.
pub fn primary(findings: Vec<Bottleneck>) -> Option<Bottleneck> {
    findings.into_iter().fold(None, |best, candidate| match best {
        Some(b) if b.severity >= candidate.severity => Some(b),
        _ => Some(candidate),
    })
}
