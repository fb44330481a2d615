use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::source_trait::{BackendDependencyLink, SourceError, TraceSource};
use super::zipkin::{parse_spans, parse_traces};
use crate::span::Span;

/// In-memory trace source for tests and offline replays.
///
/// Lookback windows are anchored at the newest span in the set rather than
/// the wall clock, so recorded traces replay the same way on any day.
pub struct StaticTraceSource {
    traces: RwLock<Vec<Vec<Span>>>,
    unavailable: AtomicBool,
}

impl StaticTraceSource {
    pub fn new(traces: Vec<Vec<Span>>) -> Self {
        Self {
            traces: RwLock::new(traces),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Load Zipkin v2 JSON: either a list of traces or a single trace.
    pub fn from_zipkin_json(json: &str) -> Result<Self, SourceError> {
        let body: Value = serde_json::from_str(json)?;
        let nested = body
            .as_array()
            .and_then(|items| items.first())
            .is_some_and(Value::is_array);

        let traces = if nested {
            parse_traces(&body)
        } else {
            vec![parse_spans(&body)]
        };
        Ok(Self::new(traces.into_iter().filter(|t| !t.is_empty()).collect()))
    }

    pub fn from_zipkin_file<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_zipkin_json(&contents)
    }

    pub async fn insert_trace(&self, spans: Vec<Span>) {
        self.traces.write().await.push(spans);
    }

    pub async fn trace_count(&self) -> usize {
        self.traces.read().await.len()
    }

    /// Make every query fail, simulating an unreachable backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("static source disabled".into()));
        }
        Ok(())
    }

    /// Newest traces first, limited to those starting inside the window.
    fn select(
        traces: &[Vec<Span>],
        limit: usize,
        lookback: Duration,
        filter: impl Fn(&[Span]) -> bool,
    ) -> Vec<Vec<Span>> {
        let Some(newest) = traces.iter().flatten().map(|s| s.timestamp).max() else {
            return Vec::new();
        };
        // an unrepresentable window keeps everything
        let cutoff = chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|window| newest.checked_sub_signed(window));

        let mut selected: Vec<&Vec<Span>> = traces
            .iter()
            .filter(|t| match (start_of(t), cutoff) {
                (Some(start), Some(cutoff)) => start >= cutoff,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .filter(|t| filter(t))
            .collect();
        selected.sort_by_key(|t| std::cmp::Reverse(start_of(t)));
        selected.into_iter().take(limit).cloned().collect()
    }
}

fn start_of(trace: &[Span]) -> Option<DateTime<Utc>> {
    trace.iter().map(|s| s.timestamp).min()
}

#[async_trait]
impl TraceSource for StaticTraceSource {
    async fn services(&self) -> Result<Vec<String>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;
        let services: BTreeSet<String> = traces
            .iter()
            .flatten()
            .map(|s| s.service_name().to_string())
            .collect();
        Ok(services.into_iter().collect())
    }

    async fn trace(&self, trace_id: &str) -> Result<Vec<Span>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;
        Ok(traces
            .iter()
            .flatten()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn recent_traces(
        &self,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;
        Ok(Self::select(&traces, limit, lookback, |_| true))
    }

    async fn traces_for_service(
        &self,
        service_name: &str,
        limit: usize,
        lookback: Duration,
    ) -> Result<Vec<Vec<Span>>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;
        Ok(Self::select(&traces, limit, lookback, |t| {
            t.iter().any(|s| s.service_name() == service_name)
        }))
    }

    async fn span_names(&self, service_name: &str) -> Result<Vec<String>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;
        let names: BTreeSet<String> = traces
            .iter()
            .flatten()
            .filter(|s| s.service_name() == service_name && !s.name.is_empty())
            .map(|s| s.name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Cross-service parent→child calls inside the window, counted per pair.
    async fn backend_dependencies(
        &self,
        lookback: Duration,
    ) -> Result<Vec<BackendDependencyLink>, SourceError> {
        self.check_available()?;
        let traces = self.traces.read().await;

        let mut links: BTreeMap<(String, String), BackendDependencyLink> = BTreeMap::new();
        for trace in Self::select(&traces, usize::MAX, lookback, |_| true) {
            let by_id: HashMap<&str, &Span> = trace.iter().map(|s| (s.id.as_str(), s)).collect();
            for span in &trace {
                let Some(parent) = span.parent().and_then(|p| by_id.get(p)) else {
                    continue;
                };
                let (from, to) = (parent.service_name(), span.service_name());
                if from == to {
                    continue;
                }
                let link = links
                    .entry((from.to_string(), to.to_string()))
                    .or_insert_with(|| BackendDependencyLink {
                        parent: from.to_string(),
                        child: to.to_string(),
                        call_count: 0,
                        error_count: 0,
                    });
                link.call_count += 1;
                link.error_count += u64::from(span.is_error());
            }
        }
        Ok(links.into_values().collect())
    }
}
