pub mod bottleneck;
pub mod builder;
pub mod cache;
pub mod classify;
pub mod config;
pub mod dependency;
pub mod explain;
pub mod flow;
pub mod service;
pub mod source;
pub mod span;
pub mod storage;

pub use bottleneck::{Bottleneck, BottleneckDetector, BottleneckType, Severity};
pub use builder::FlowGraphBuilder;
pub use cache::{FlowCache, LruFlowCache, QueryCache};
pub use classify::NodeClassifier;
pub use config::Config;
pub use dependency::{DependencyAggregator, DependencyGraph, ServiceDependency};
pub use explain::{ExplanationOutcome, FlowExplainer, FlowExplanation};
pub use flow::{ApiFlowGraph, EdgeMetrics, FlowEdge, FlowStatus, ServiceNode};
pub use service::{FlowAnalysis, FlowService, FlowStats, FlowSummary};
pub use source::{StaticTraceSource, TraceSource, ZipkinClient};
pub use span::{Endpoint, Span, SpanKind};
pub use storage::{create_snapshot_store, MemorySnapshotStore, SnapshotStore};
