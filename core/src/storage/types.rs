use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bottleneck::Bottleneck;
use crate::flow::{ApiFlowGraph, FlowStatus};

/// Persisted flow graph plus denormalized columns for querying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub id: Uuid,
    pub trace_id: String,
    pub root_service: String,
    pub root_endpoint: String,
    /// Serialized [`ApiFlowGraph`]
    pub graph_json: String,
    pub total_duration_ms: u64,
    pub status: FlowStatus,
    pub node_count: usize,
    pub edge_count: usize,
    pub has_bottleneck: bool,
    pub bottleneck_service: Option<String>,
    pub explanation: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FlowSnapshot {
    pub fn from_graph(graph: &ApiFlowGraph, primary: Option<&Bottleneck>) -> Result<Self> {
        let graph_json =
            serde_json::to_string(graph).context("Failed to serialize flow graph")?;

        Ok(Self {
            id: Uuid::new_v4(),
            trace_id: graph.trace_id.clone(),
            root_service: graph.root_service.clone(),
            root_endpoint: graph.root_endpoint.clone(),
            graph_json,
            total_duration_ms: graph.total_duration_ms(),
            status: graph.status,
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
            has_bottleneck: primary.is_some(),
            bottleneck_service: primary.map(|b| b.service_name.clone()),
            explanation: None,
            created_at: Utc::now(),
        })
    }

    pub fn graph(&self) -> Result<ApiFlowGraph> {
        serde_json::from_str(&self.graph_json)
            .with_context(|| format!("Failed to deserialize flow graph {}", self.trace_id))
    }
}

/// Fields written back onto a snapshot after an explanation is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationUpdate {
    pub explanation: String,
    pub bottleneck_service: Option<String>,
    pub has_bottleneck: bool,
}

/// Snapshot counts per flow status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: u64,
    pub partial_failure: u64,
    pub failure: u64,
    pub timeout: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: FlowStatus, count: u64) {
        match status {
            FlowStatus::Success => self.success += count,
            FlowStatus::PartialFailure => self.partial_failure += count,
            FlowStatus::Failure => self.failure += count,
            FlowStatus::Timeout => self.timeout += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.partial_failure + self.failure + self.timeout
    }

    /// Partial and complete failures.
    pub fn failed(&self) -> u64 {
        self.partial_failure + self.failure
    }
}
