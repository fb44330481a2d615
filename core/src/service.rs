use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::bottleneck::{Bottleneck, BottleneckDetector};
use crate::builder::FlowGraphBuilder;
use crate::cache::{FlowCache, LruFlowCache, QueryCache};
use crate::config::Config;
use crate::dependency::DependencyGraph;
use crate::explain::{self, ExplanationOutcome, FlowExplainer};
use crate::flow::{ApiFlowGraph, FlowEdge, FlowStatus};
use crate::source::{BackendDependencyLink, SourceError, TraceSource, ZipkinClient};
use crate::storage::{self, ExplanationUpdate, FlowSnapshot, SnapshotStore};

/// List-view projection of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub trace_id: String,
    pub root_service: String,
    pub root_endpoint: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: FlowStatus,
    pub node_count: usize,
    pub has_bottleneck: bool,
    pub bottleneck_service: Option<String>,
}

impl FlowSummary {
    pub fn from_graph(graph: &ApiFlowGraph, primary: Option<&Bottleneck>) -> Self {
        Self {
            trace_id: graph.trace_id.clone(),
            root_service: graph.root_service.clone(),
            root_endpoint: graph.root_endpoint.clone(),
            start_time: graph.start_time,
            duration_ms: graph.total_duration_ms(),
            status: graph.status,
            node_count: graph.nodes.len(),
            has_bottleneck: primary.is_some(),
            bottleneck_service: primary.map(|b| b.service_name.clone()),
        }
    }
}

/// Graph, findings and explanation for one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowAnalysis {
    pub graph: ApiFlowGraph,
    pub bottlenecks: Vec<Bottleneck>,
    pub explanation: ExplanationOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub total_flows: u64,
    pub successful_flows: u64,
    pub failed_flows: u64,
    pub service_count: usize,
    pub services: Vec<String>,
}

/// Coordinates fetch → build → analyze over a trace source, with a bounded
/// graph cache in front of a durable snapshot store.
///
/// Building and detection hold no locks; the cache is the only shared
/// mutable state between concurrent requests.
pub struct FlowService {
    source: Arc<dyn TraceSource>,
    store: Arc<dyn SnapshotStore>,
    explainer: Arc<dyn FlowExplainer>,
    cache: Arc<dyn FlowCache>,
    builder: FlowGraphBuilder,
    detector: BottleneckDetector,
    services_cache: QueryCache<(), Vec<String>>,
    dependency_cache: QueryCache<u128, DependencyGraph>,
    default_limit: usize,
    default_lookback: Duration,
    dependency_batch_size: usize,
}

impl FlowService {
    pub fn new(
        config: &Config,
        source: Arc<dyn TraceSource>,
        store: Arc<dyn SnapshotStore>,
        explainer: Arc<dyn FlowExplainer>,
    ) -> Self {
        let ttl = Duration::from_secs(config.cache.query_ttl_seconds);
        Self {
            source,
            store,
            explainer,
            cache: Arc::new(LruFlowCache::new(config.cache.flow_capacity)),
            builder: FlowGraphBuilder::from_config(config),
            detector: BottleneckDetector::new(config.detection.clone()),
            services_cache: QueryCache::new(ttl),
            dependency_cache: QueryCache::new(ttl),
            default_limit: config.zipkin.default_limit,
            default_lookback: config.zipkin.default_lookback(),
            dependency_batch_size: config.zipkin.dependency_batch_size,
        }
    }

    /// Wire a service against Zipkin, the configured snapshot store and explainer.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let source = ZipkinClient::new(&config.zipkin).context("Failed to create Zipkin client")?;
        let store = storage::create_snapshot_store(&config.storage).await?;
        let explainer = explain::create_explainer(&config.explainer)
            .context("Failed to create flow explainer")?;

        Ok(Self::new(config, Arc::new(source), store, explainer))
    }

    /// Replace the default LRU graph cache.
    pub fn with_flow_cache(mut self, cache: Arc<dyn FlowCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn builder(&self) -> &FlowGraphBuilder {
        &self.builder
    }

    pub fn detector(&self) -> &BottleneckDetector {
        &self.detector
    }

    pub fn flow_cache(&self) -> &Arc<dyn FlowCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    fn limit(&self, limit: usize) -> usize {
        if limit > 0 {
            limit
        } else {
            self.default_limit
        }
    }

    fn lookback(&self, lookback: Duration) -> Duration {
        if lookback.is_zero() {
            self.default_lookback
        } else {
            lookback
        }
    }

    // Read surface ----------------------------------------------------------

    pub async fn services(&self) -> Vec<String> {
        let source = &self.source;
        self.services_cache
            .get_or_fetch((), || source.services())
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to fetch services: {}", e);
                Vec::new()
            })
    }

    /// Dependency graph over a batch of recent traces. Cached per window.
    pub async fn dependency_graph(&self, lookback: Duration) -> DependencyGraph {
        let lookback = self.lookback(lookback);
        let source = &self.source;
        let batch = self.dependency_batch_size;

        let result = self
            .dependency_cache
            .get_or_fetch(lookback.as_millis(), || async move {
                let traces = source.recent_traces(batch, lookback).await?;
                Ok::<_, SourceError>(self.builder.build_dependency_graph(&traces))
            })
            .await;

        result.unwrap_or_else(|e| {
            tracing::error!("Failed to build dependency graph: {}", e);
            DependencyGraph::empty()
        })
    }

    /// Operation names the backend recorded for a service.
    pub async fn span_names(&self, service_name: &str) -> Vec<String> {
        self.source.fetch_span_names(service_name).await
    }

    /// Service links as aggregated by the backend, as opposed to
    /// [`FlowService::dependency_graph`] which folds raw traces locally.
    pub async fn backend_links(&self, lookback: Duration) -> Vec<BackendDependencyLink> {
        self.source
            .fetch_backend_dependencies(self.lookback(lookback))
            .await
    }

    /// Resolve a trace id through the cache, the snapshot store, then the source.
    pub async fn get_flow(&self, trace_id: &str) -> Option<ApiFlowGraph> {
        if let Some(graph) = self.cache.get(trace_id) {
            tracing::debug!(trace_id, "Flow cache hit");
            return Some(graph);
        }

        match self.store.find_by_trace_id(trace_id).await {
            Ok(Some(snapshot)) => match snapshot.graph() {
                Ok(graph) => {
                    tracing::debug!(trace_id, "Flow restored from snapshot");
                    self.cache.insert(graph.clone());
                    return Some(graph);
                }
                Err(e) => tracing::warn!("Failed to deserialize cached flow {}: {:#}", trace_id, e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Snapshot lookup failed for {}: {:#}", trace_id, e),
        }

        tracing::debug!(trace_id, "Flow cache miss, fetching trace");
        let spans = self.source.fetch_trace(trace_id).await;
        let graph = self.builder.build_from_trace(&spans)?;

        self.cache.insert(graph.clone());
        self.persist(&graph).await;
        Some(graph)
    }

    /// Resolve several trace ids concurrently. Results line up with `trace_ids`.
    pub async fn get_flows(&self, trace_ids: &[String]) -> Vec<Option<ApiFlowGraph>> {
        futures::future::join_all(trace_ids.iter().map(|id| self.get_flow(id))).await
    }

    pub async fn bottlenecks(&self, trace_id: &str) -> Option<Vec<Bottleneck>> {
        let graph = self.get_flow(trace_id).await?;
        Some(self.detector.detect(&graph))
    }

    /// Summaries of recent flows, optionally for traces touching one service.
    pub async fn recent_flows(
        &self,
        service: Option<&str>,
        limit: usize,
        lookback: Duration,
    ) -> Vec<FlowSummary> {
        let limit = self.limit(limit);
        let lookback = self.lookback(lookback);

        let traces = match service.filter(|s| !s.is_empty()) {
            Some(service) => {
                self.source
                    .fetch_traces_for_service(service, limit, lookback)
                    .await
            }
            None => self.source.fetch_recent_traces(limit, lookback).await,
        };

        traces
            .iter()
            .filter_map(|spans| self.builder.build_from_trace(spans))
            .map(|graph| {
                let primary = self.detector.find_primary(&graph);
                FlowSummary::from_graph(&graph, primary.as_ref())
            })
            .collect()
    }

    /// Recent flows with at least one finding. Scans twice the limit.
    pub async fn bottleneck_flows(&self, limit: usize, lookback: Duration) -> Vec<FlowSummary> {
        let limit = self.limit(limit);
        self.recent_flows(None, limit.saturating_mul(2), lookback)
            .await
            .into_iter()
            .filter(|summary| summary.has_bottleneck)
            .take(limit)
            .collect()
    }

    /// Graph, findings and explanation for a trace. The explanation is written
    /// back onto the stored snapshot.
    pub async fn analyze(&self, trace_id: &str) -> Option<FlowAnalysis> {
        let graph = self.get_flow(trace_id).await?;
        let bottlenecks = self.detector.detect(&graph);
        let explanation = explain::explain_flow(self.explainer.as_ref(), &graph, &bottlenecks).await;

        let update = ExplanationUpdate {
            explanation: explanation.explanation.summary.clone(),
            bottleneck_service: explanation.explanation.bottleneck_service.clone(),
            has_bottleneck: !bottlenecks.is_empty(),
        };
        match self.store.record_explanation(trace_id, update).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(trace_id, "No snapshot to attach explanation to"),
            Err(e) => tracing::warn!("Failed to store explanation for {}: {:#}", trace_id, e),
        }

        Some(FlowAnalysis {
            graph,
            bottlenecks,
            explanation,
        })
    }

    /// Flow counts from stored snapshots plus the source's service list.
    pub async fn stats(&self, lookback: Duration) -> Result<FlowStats> {
        let since = since(self.lookback(lookback));
        let counts = self
            .store
            .status_counts(since)
            .await
            .context("Failed to count flow snapshots")?;
        let services = self.services().await;

        Ok(FlowStats {
            total_flows: counts.total(),
            successful_flows: counts.success,
            failed_flows: counts.failed(),
            service_count: services.len(),
            services,
        })
    }

    /// Edges merged by identity across recent flows.
    pub async fn edge_profile(
        &self,
        service: Option<&str>,
        limit: usize,
        lookback: Duration,
    ) -> Vec<FlowEdge> {
        let limit = self.limit(limit);
        let lookback = self.lookback(lookback);
        let traces = match service.filter(|s| !s.is_empty()) {
            Some(service) => {
                self.source
                    .fetch_traces_for_service(service, limit, lookback)
                    .await
            }
            None => self.source.fetch_recent_traces(limit, lookback).await,
        };

        let graphs: Vec<ApiFlowGraph> = traces
            .iter()
            .filter_map(|spans| self.builder.build_from_trace(spans))
            .collect();
        self.builder.aggregate_edges(&graphs)
    }

    /// Delete snapshots older than `retention`.
    pub async fn prune_snapshots(&self, retention: Duration) -> Result<u64> {
        let cutoff = since(retention);
        let deleted = self
            .store
            .delete_before(cutoff)
            .await
            .context("Failed to prune flow snapshots")?;
        tracing::info!(deleted, cutoff = %cutoff, "Pruned flow snapshots");
        Ok(deleted)
    }

    async fn persist(&self, graph: &ApiFlowGraph) {
        let primary = self.detector.find_primary(graph);
        let result = match FlowSnapshot::from_graph(graph, primary.as_ref()) {
            Ok(snapshot) => self.store.save(snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist flow snapshot {}: {:#}", graph.trace_id, e);
        }
    }
}

fn since(window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
