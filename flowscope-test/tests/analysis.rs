use anyhow::Result;
use flowscope_core::explain::{EstimatedImpact, ExplanationSource, FallbackReason};
use flowscope_core::{Config, SnapshotStore};
use flowscope_test::fixtures::{checkout_trace, healthy_trace};
use flowscope_test::harness::{Script, ScriptedExplainer, TestApp};
use serde_json::json;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn analysis_uses_generated_explanation() -> Result<()> {
    let explainer = ScriptedExplainer::new(Script::Reply(format!(
        "```json\n{}\n```",
        json!({
            "summary": "Payments is failing every charge.",
            "bottleneckService": "payments",
            "rootCause": "Upstream card processor rejects requests",
            "recommendations": ["Add a circuit breaker"],
            "estimatedImpact": "high"
        })
    )));
    let app =
        TestApp::with_explainer(Config::default(), vec![checkout_trace("t1")], explainer).await?;

    let analysis = app.service.analyze("t1").await.expect("analysis");
    assert_eq!(analysis.explanation.source, ExplanationSource::Generated);
    assert!(!analysis.explanation.is_fallback());
    assert_eq!(analysis.graph.trace_id, "t1");
    assert!(!analysis.bottlenecks.is_empty());

    let explanation = &analysis.explanation.explanation;
    assert_eq!(explanation.bottleneck_service.as_deref(), Some("payments"));
    assert_eq!(explanation.estimated_impact, EstimatedImpact::High);
    assert_eq!(explanation.recommendations.len(), 1);
    assert_eq!(app.explainer.calls(), 1);

    let snapshot = app.store.find_by_trace_id("t1").await?.expect("snapshot");
    assert_eq!(
        snapshot.explanation.as_deref(),
        Some("Payments is failing every charge.")
    );
    assert_eq!(snapshot.bottleneck_service.as_deref(), Some("payments"));
    assert!(snapshot.has_bottleneck);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_explainer_falls_back_to_primary_bottleneck() -> Result<()> {
    let explainer = ScriptedExplainer::new(Script::Fail { status: 503 });
    let app =
        TestApp::with_explainer(Config::default(), vec![checkout_trace("t1")], explainer).await?;

    let analysis = app.service.analyze("t1").await.expect("analysis");
    assert!(matches!(
        analysis.explanation.source,
        ExplanationSource::Fallback {
            reason: FallbackReason::CollaboratorFailed(_)
        }
    ));

    // The error-rate finding on payments is the only critical one.
    let explanation = &analysis.explanation.explanation;
    assert_eq!(explanation.bottleneck_service.as_deref(), Some("payments"));
    assert_eq!(explanation.estimated_impact, EstimatedImpact::High);
    assert!(explanation.summary.contains("gateway"));
    assert!(!explanation.recommendations.is_empty());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unparsable_and_disabled_explanations_are_tagged() -> Result<()> {
    let garbled = ScriptedExplainer::new(Script::Reply("the flow looks slow".into()));
    let app = TestApp::with_explainer(Config::default(), vec![healthy_trace("ok", 0)], garbled)
        .await?;

    let analysis = app.service.analyze("ok").await.expect("analysis");
    assert!(matches!(
        analysis.explanation.source,
        ExplanationSource::Fallback {
            reason: FallbackReason::Unparsable(_)
        }
    ));
    assert!(analysis.bottlenecks.is_empty());
    assert_eq!(analysis.explanation.explanation.bottleneck_service, None);
    assert_eq!(
        analysis.explanation.explanation.estimated_impact,
        EstimatedImpact::Low
    );

    let snapshot = app.store.find_by_trace_id("ok").await?.expect("snapshot");
    assert!(!snapshot.has_bottleneck);
    assert!(snapshot.explanation.is_some());

    let disabled = TestApp::new(Config::default(), vec![healthy_trace("ok", 0)]).await?;
    let analysis = disabled.service.analyze("ok").await.expect("analysis");
    assert_eq!(
        analysis.explanation.source,
        ExplanationSource::Fallback {
            reason: FallbackReason::Disabled
        }
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats_come_from_stored_snapshots() -> Result<()> {
    let traces = vec![
        checkout_trace("partial"),
        healthy_trace("ok-1", 10),
        healthy_trace("ok-2", 20),
    ];
    let app = TestApp::new(Config::default(), traces).await?;

    // Nothing persisted yet: recent listings do not write snapshots.
    app.service.recent_flows(None, 10, HOUR).await;
    let empty = app.service.stats(HOUR).await?;
    assert_eq!(empty.total_flows, 0);
    assert_eq!(empty.service_count, 4);

    for id in ["partial", "ok-1", "ok-2"] {
        app.service.get_flow(id).await.expect("flow");
    }

    let stats = app.service.stats(HOUR).await?;
    assert_eq!(stats.total_flows, 3);
    assert_eq!(stats.successful_flows, 2);
    assert_eq!(stats.failed_flows, 1);
    assert_eq!(
        stats.services,
        vec!["gateway", "inventory", "orders", "payments"]
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn prune_removes_only_old_snapshots() -> Result<()> {
    let app = TestApp::new(
        Config::default(),
        vec![checkout_trace("t1"), healthy_trace("t2", 10)],
    )
    .await?;
    app.service.get_flow("t1").await.expect("t1");
    app.service.get_flow("t2").await.expect("t2");

    assert_eq!(app.service.prune_snapshots(HOUR).await?, 0);
    assert_eq!(app.store.len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        app.service
            .prune_snapshots(Duration::from_millis(1))
            .await?,
        2
    );
    assert!(app.store.is_empty());

    Ok(())
}
