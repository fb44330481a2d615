use anyhow::Result;
use flowscope_core::flow::EdgeStatus;
use flowscope_core::{
    BottleneckType, Config, FlowCache, FlowStatus, SnapshotStore, StaticTraceSource, TraceSource,
};
use flowscope_test::fixtures::{
    checkout_trace, dependency_traces, fan_out_trace, healthy_trace, zipkin_trace_json,
};
use flowscope_test::harness::TestApp;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkout_flow_is_reconstructed() -> Result<()> {
    let app = TestApp::new(Config::default(), vec![checkout_trace("checkout-1")]).await?;

    let graph = app
        .service
        .get_flow("checkout-1")
        .await
        .expect("checkout flow");

    assert_eq!(graph.nodes.len(), 3);
    assert_eq!(graph.edges.len(), 2);
    assert_eq!(graph.status, FlowStatus::PartialFailure);
    assert_eq!(graph.root_service, "gateway");
    assert_eq!(graph.total_duration_ms(), 10);

    let to_orders = graph
        .edges
        .iter()
        .find(|e| e.target_service == "orders")
        .expect("gateway → orders");
    assert_eq!(to_orders.status, EdgeStatus::Slow);
    assert_eq!(to_orders.metrics.p95_latency_ms(), 600);

    let findings = app.service.bottlenecks("checkout-1").await.expect("findings");
    assert!(findings.iter().any(|b| {
        b.service_name == "payments" && b.bottleneck_type == BottleneckType::HighErrorRate
    }));
    assert!(findings.iter().any(|b| {
        b.service_name == "orders" && b.bottleneck_type == BottleneckType::HighLatency
    }));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_trace_is_not_found() -> Result<()> {
    let app = TestApp::new(Config::default(), vec![checkout_trace("checkout-1")]).await?;

    assert!(app.service.get_flow("does-not-exist").await.is_none());
    assert!(app.service.bottlenecks("does-not-exist").await.is_none());
    assert!(app.service.analyze("does-not-exist").await.is_none());
    assert!(app.store.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flows_are_cached_then_restored_from_snapshots() -> Result<()> {
    let app = TestApp::new(Config::default(), vec![checkout_trace("checkout-1")]).await?;

    let built = app.service.get_flow("checkout-1").await.expect("flow");
    assert_eq!(app.cache.len(), 1);
    assert_eq!(app.store.len(), 1);

    let snapshot = app
        .store
        .find_by_trace_id("checkout-1")
        .await?
        .expect("snapshot");
    assert!(snapshot.has_bottleneck);
    assert_eq!(snapshot.bottleneck_service.as_deref(), Some("payments"));
    assert_eq!(snapshot.node_count, 3);

    // Drop the cache and the backend: the snapshot alone must answer.
    app.cache.remove("checkout-1");
    app.source.set_unavailable(true);

    let restored = app.service.get_flow("checkout-1").await.expect("restored");
    assert_eq!(restored, built);
    assert_eq!(app.cache.len(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_evicts_least_recently_used_flow() -> Result<()> {
    let mut config = Config::default();
    config.cache.flow_capacity = 2;
    let traces = vec![
        checkout_trace("t1"),
        healthy_trace("t2", 10),
        healthy_trace("t3", 20),
    ];
    let app = TestApp::new(config, traces).await?;

    app.service.get_flow("t1").await.expect("t1");
    app.service.get_flow("t2").await.expect("t2");
    app.service.get_flow("t1").await.expect("t1 again");
    app.service.get_flow("t3").await.expect("t3");

    assert_eq!(app.cache.len(), 2);
    assert!(app.cache.get("t1").is_some());
    assert!(app.cache.get("t2").is_none());
    assert_eq!(app.store.len(), 3);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_lookup_keeps_request_order() -> Result<()> {
    let app = TestApp::new(
        Config::default(),
        vec![checkout_trace("t1"), healthy_trace("t2", 10)],
    )
    .await?;

    let ids = vec!["t2".to_string(), "missing".to_string(), "t1".to_string()];
    let flows = app.service.get_flows(&ids).await;

    assert_eq!(flows.len(), 3);
    assert_eq!(flows[0].as_ref().map(|g| g.trace_id.as_str()), Some("t2"));
    assert!(flows[1].is_none());
    assert_eq!(flows[2].as_ref().map(|g| g.trace_id.as_str()), Some("t1"));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependency_graph_merges_calls_across_traces() -> Result<()> {
    let app = TestApp::new(Config::default(), dependency_traces()).await?;

    let graph = app.service.dependency_graph(HOUR).await;
    assert_eq!(graph.total_traces, 2);
    assert_eq!(graph.services, vec!["A", "B"]);
    assert_eq!(graph.dependencies.len(), 1);

    let dep = graph.get("A", "B").expect("A → B");
    assert_eq!(dep.request_count, 2);
    assert_eq!(dep.avg_latency_ms, 200.0);
    assert_eq!(dep.p95_latency_ms, 300.0);
    assert_eq!(dep.error_rate, 0.0);

    // Cached per window: a new trace does not show up until the entry expires.
    app.source.insert_trace(checkout_trace("late")).await;
    assert_eq!(app.service.dependency_graph(HOUR).await.total_traces, 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recent_and_bottleneck_flows() -> Result<()> {
    let traces = vec![
        checkout_trace("slow"),
        healthy_trace("fine-1", 10),
        healthy_trace("fine-2", 20),
        fan_out_trace("wide", 7),
    ];
    let app = TestApp::new(Config::default(), traces).await?;

    let recent = app.service.recent_flows(None, 10, HOUR).await;
    assert_eq!(recent.len(), 4);

    let inventory_only = app.service.recent_flows(Some("inventory"), 10, HOUR).await;
    let mut ids: Vec<_> = inventory_only.iter().map(|f| f.trace_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["fine-1", "fine-2"]);

    let flagged = app.service.bottleneck_flows(10, HOUR).await;
    let mut flagged_ids: Vec<_> = flagged.iter().map(|f| f.trace_id.as_str()).collect();
    flagged_ids.sort();
    assert_eq!(flagged_ids, vec!["slow", "wide"]);

    let wide = flagged.iter().find(|f| f.trace_id == "wide").expect("wide");
    assert_eq!(wide.bottleneck_service.as_deref(), Some("aggregator"));

    assert_eq!(app.service.bottleneck_flows(1, HOUR).await.len(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_source_degrades_to_empty_results() -> Result<()> {
    let app = TestApp::new(Config::default(), vec![checkout_trace("t1")]).await?;
    app.source.set_unavailable(true);

    assert!(app.service.services().await.is_empty());
    assert!(app.service.recent_flows(None, 10, HOUR).await.is_empty());
    assert!(app.service.get_flow("t1").await.is_none());
    assert!(app.service.edge_profile(None, 10, HOUR).await.is_empty());

    let graph = app.service.dependency_graph(HOUR).await;
    assert!(graph.dependencies.is_empty());

    // The failure was not cached.
    app.source.set_unavailable(false);
    assert_eq!(app.service.dependency_graph(HOUR).await.total_traces, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn edge_profile_merges_same_edges() -> Result<()> {
    let traces = vec![
        healthy_trace("h1", 0),
        healthy_trace("h2", 10),
        healthy_trace("h3", 20),
    ];
    let app = TestApp::new(Config::default(), traces).await?;

    let edges = app.service.edge_profile(None, 10, HOUR).await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].metrics.request_count, 3);
    assert_eq!(edges[0].status, EdgeStatus::Normal);
    assert_eq!(edges[0].sample_trace_ids.len(), 3);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backend_links_and_span_names() -> Result<()> {
    let traces = vec![
        checkout_trace("c1"),
        checkout_trace("c2"),
        healthy_trace("h1", 10),
    ];
    let app = TestApp::new(Config::default(), traces).await?;

    let links = app.service.backend_links(HOUR).await;
    let pairs: Vec<_> = links
        .iter()
        .map(|l| (l.parent.as_str(), l.child.as_str(), l.call_count, l.error_count))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("gateway", "inventory", 1, 0),
            ("gateway", "orders", 2, 0),
            ("orders", "payments", 2, 2),
        ]
    );

    assert_eq!(app.service.span_names("payments").await, vec!["payments handler"]);
    assert!(app.service.span_names("nobody").await.is_empty());

    app.source.set_unavailable(true);
    assert!(app.service.backend_links(HOUR).await.is_empty());
    assert!(app.service.span_names("payments").await.is_empty());

    Ok(())
}

#[tokio::test]
async fn zipkin_payload_replays_through_static_source() -> Result<()> {
    let source = StaticTraceSource::from_zipkin_json(&zipkin_trace_json("zk-1"))?;

    let spans = source.trace("zk-1").await?;
    assert_eq!(spans.len(), 2, "span without an id is skipped");
    assert!(spans[1].is_error(), "5xx status marks the span as failed");

    let services = source.services().await?;
    assert_eq!(services, vec!["gateway", "orders"]);

    Ok(())
}
