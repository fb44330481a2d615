use anyhow::{Context, Result};
use async_trait::async_trait;
use flowscope_core::explain::{ExplainError, FlowExplainer};
use flowscope_core::{
    Config, FlowCache, FlowService, LruFlowCache, MemorySnapshotStore, Span, StaticTraceSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a [`ScriptedExplainer`] answers with.
#[derive(Debug, Clone)]
pub enum Script {
    Reply(String),
    Fail { status: u16 },
    Disabled,
}

/// Explainer double that returns a fixed answer and counts calls.
pub struct ScriptedExplainer {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedExplainer {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(value: serde_json::Value) -> Self {
        Self::new(Script::Reply(value.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowExplainer for ScriptedExplainer {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ExplainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Reply(body) => Ok(body.clone()),
            Script::Fail { status } => Err(ExplainError::Status {
                status: *status,
                body: "scripted failure".into(),
            }),
            Script::Disabled => Err(ExplainError::Disabled),
        }
    }
}

/// A `FlowService` over in-memory collaborators, with handles to each of them.
pub struct TestApp {
    pub service: FlowService,
    pub source: Arc<StaticTraceSource>,
    pub store: Arc<MemorySnapshotStore>,
    pub cache: Arc<LruFlowCache>,
    pub explainer: Arc<ScriptedExplainer>,
}

impl TestApp {
    pub async fn new(config: Config, traces: Vec<Vec<Span>>) -> Result<Self> {
        Self::with_explainer(config, traces, ScriptedExplainer::new(Script::Disabled)).await
    }

    pub async fn with_explainer(
        mut config: Config,
        traces: Vec<Vec<Span>>,
        explainer: ScriptedExplainer,
    ) -> Result<Self> {
        config.storage.backend = "memory".into();
        config.validate().context("test config is invalid")?;

        let source = Arc::new(StaticTraceSource::new(traces));
        let store = Arc::new(MemorySnapshotStore::new());
        let cache = Arc::new(LruFlowCache::new(config.cache.flow_capacity));
        let explainer = Arc::new(explainer);

        let service = FlowService::new(
            &config,
            source.clone(),
            store.clone(),
            explainer.clone(),
        )
        .with_flow_cache(cache.clone() as Arc<dyn FlowCache>);

        Ok(Self {
            service,
            source,
            store,
            cache,
            explainer,
        })
    }
}
