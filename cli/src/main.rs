use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use flowscope_core::explain::{self, ExplanationSource};
use flowscope_core::{storage, Config, FlowService, FlowSummary, StaticTraceSource};

const DEFAULT_LIMIT: usize = 20;
const DEFAULT_LOOKBACK_MINUTES: u64 = 60;

#[derive(Parser)]
#[command(name = "flowscope")]
#[command(about = "API flow reconstruction and bottleneck analysis over distributed traces", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "flowscope.toml")]
    config: PathBuf,

    /// Replay traces from a Zipkin JSON file instead of querying the backend
    #[arg(long, global = true)]
    traces: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List services known to the tracing backend
    Services {
        #[arg(long)]
        json: bool,
    },

    /// Show service-to-service dependencies aggregated over recent traces
    Dependencies {
        /// Time window in minutes
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// List recent flows
    Flows {
        /// Only traces that touch this service
        #[arg(short, long)]
        service: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// List recent flows that have at least one bottleneck
    BottleneckFlows {
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// Show the flow graph for one trace
    Flow {
        #[arg(short = 'i', long = "id")]
        trace_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Show bottleneck findings for one trace
    Bottlenecks {
        #[arg(short = 'i', long = "id")]
        trace_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Explain one trace's flow and bottlenecks
    Analyze {
        #[arg(short = 'i', long = "id")]
        trace_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Show service links as aggregated by the tracing backend
    Links {
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// List operation names recorded for a service
    SpanNames {
        #[arg(short, long)]
        service: String,
        #[arg(long)]
        json: bool,
    },

    /// Show per-edge metrics merged across recent flows
    Edges {
        #[arg(short, long)]
        service: Option<String>,
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// Show flow counts from stored snapshots
    Stats {
        #[arg(long, default_value_t = DEFAULT_LOOKBACK_MINUTES)]
        lookback: u64,
        #[arg(long)]
        json: bool,
    },

    /// Delete stored snapshots older than the retention window
    Prune {
        /// Retention in hours
        #[arg(long, default_value_t = 24 * 7)]
        retention_hours: u64,
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };
    config.validate()?;

    init_logging(&config);
    if !cli.config.exists() {
        tracing::warn!("Config file not found at {:?}, using defaults", cli.config);
    }

    let service = build_service(&config, cli.traces.as_deref()).await?;

    match cli.command {
        Commands::Services { json } => handle_services(&service, json).await?,
        Commands::Dependencies { lookback, json } => {
            handle_dependencies(&service, minutes(lookback), json).await?
        }
        Commands::Flows {
            service: filter,
            limit,
            lookback,
            json,
        } => {
            let flows = service
                .recent_flows(filter.as_deref(), limit, minutes(lookback))
                .await;
            print_flows(&flows, json)?
        }
        Commands::BottleneckFlows {
            limit,
            lookback,
            json,
        } => {
            let flows = service.bottleneck_flows(limit, minutes(lookback)).await;
            print_flows(&flows, json)?
        }
        Commands::Links { lookback, json } => {
            handle_links(&service, minutes(lookback), json).await?
        }
        Commands::SpanNames {
            service: name,
            json,
        } => handle_span_names(&service, &name, json).await?,
        Commands::Flow { trace_id, json } => handle_flow(&service, &trace_id, json).await?,
        Commands::Bottlenecks { trace_id, json } => {
            handle_bottlenecks(&service, &trace_id, json).await?
        }
        Commands::Analyze { trace_id, json } => handle_analyze(&service, &trace_id, json).await?,
        Commands::Edges {
            service: filter,
            limit,
            lookback,
            json,
        } => handle_edges(&service, filter.as_deref(), limit, minutes(lookback), json).await?,
        Commands::Stats { lookback, json } => handle_stats(&service, minutes(lookback), json).await?,
        Commands::Prune {
            retention_hours,
            json,
        } => {
            let deleted = service
                .prune_snapshots(hours(retention_hours))
                .await?;
            if json {
                print_json(&serde_json::json!({ "deleted": deleted }))?;
            } else {
                println!("🧹 Deleted {} snapshot(s) older than {}h", deleted, retention_hours);
            }
        }
        Commands::Config => {} // printed before loading config
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.include_modules)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn build_service(config: &Config, traces: Option<&std::path::Path>) -> Result<FlowService> {
    let Some(path) = traces else {
        return FlowService::from_config(config).await;
    };

    let source = StaticTraceSource::from_zipkin_file(path)
        .with_context(|| format!("Failed to load traces from {:?}", path))?;
    tracing::info!("Trace source: {:?} ({} traces)", path, source.trace_count().await);

    let store = storage::create_snapshot_store(&config.storage).await?;
    let explainer = explain::create_explainer(&config.explainer)?;
    Ok(FlowService::new(config, Arc::new(source), store, explainer))
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

fn hours(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(3600))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_services(service: &FlowService, json: bool) -> Result<()> {
    let services = service.services().await;
    if json {
        return print_json(&services);
    }

    println!("🧭 Services ({})", services.len());
    for name in services {
        println!("  • {}", name);
    }
    Ok(())
}

async fn handle_dependencies(service: &FlowService, lookback: Duration, json: bool) -> Result<()> {
    let graph = service.dependency_graph(lookback).await;
    if json {
        return print_json(&graph);
    }

    println!(
        "🔗 Dependencies ({} services, {} links, {} traces)",
        graph.services.len(),
        graph.dependencies.len(),
        graph.total_traces
    );
    println!(
        "{:<24} {:<24} {:>8} {:>10} {:>10} {:>8}",
        "FROM", "TO", "CALLS", "AVG MS", "P95 MS", "ERRORS"
    );
    for dep in &graph.dependencies {
        println!(
            "{:<24} {:<24} {:>8} {:>10.1} {:>10.1} {:>7.1}%",
            dep.source_service,
            dep.target_service,
            dep.request_count,
            dep.avg_latency_ms,
            dep.p95_latency_ms,
            dep.error_rate * 100.0
        );
    }
    Ok(())
}

async fn handle_links(service: &FlowService, lookback: Duration, json: bool) -> Result<()> {
    let links = service.backend_links(lookback).await;
    if json {
        return print_json(&links);
    }

    println!("🛰️  Backend links ({})", links.len());
    println!("{:<24} {:<24} {:>8} {:>8}", "PARENT", "CHILD", "CALLS", "ERRORS");
    for link in &links {
        println!(
            "{:<24} {:<24} {:>8} {:>8}",
            link.parent, link.child, link.call_count, link.error_count
        );
    }
    Ok(())
}

async fn handle_span_names(service: &FlowService, service_name: &str, json: bool) -> Result<()> {
    let names = service.span_names(service_name).await;
    if json {
        return print_json(&names);
    }

    println!("🏷️  Span names for {} ({})", service_name, names.len());
    for name in names {
        println!("  • {}", name);
    }
    Ok(())
}

fn print_flows(flows: &[FlowSummary], json: bool) -> Result<()> {
    if json {
        return print_json(&flows);
    }

    println!("📋 Flows ({})", flows.len());
    println!(
        "{:<34} {:<24} {:>8} {:<16} {:>6} {}",
        "TRACE ID", "ROOT SERVICE", "MS", "STATUS", "NODES", "BOTTLENECK"
    );
    for flow in flows {
        println!(
            "{:<34} {:<24} {:>8} {:<16} {:>6} {}",
            flow.trace_id,
            flow.root_service,
            flow.duration_ms,
            flow.status.as_str(),
            flow.node_count,
            flow.bottleneck_service.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn handle_flow(service: &FlowService, trace_id: &str, json: bool) -> Result<()> {
    let Some(graph) = service.get_flow(trace_id).await else {
        anyhow::bail!("Trace not found: {}", trace_id);
    };
    if json {
        return print_json(&graph);
    }

    println!("🔍 Flow {}", graph.trace_id);
    println!(
        "• Root: {} {}  • Status: {}  • Duration: {}ms  • Spans: {}",
        graph.root_service,
        graph.root_endpoint,
        graph.status.as_str(),
        graph.total_duration_ms(),
        graph.span_count
    );

    println!("\nNodes:");
    for node in &graph.nodes {
        println!(
            "  {:<24} {:<32} {:?} ({:?})",
            node.service_name, node.endpoint, node.node_type, node.health
        );
    }

    println!("\nEdges:");
    for edge in &graph.edges {
        println!(
            "  {:<24} → {:<24} {:>10} {:>8} {:?}",
            edge.source_service,
            edge.target_service,
            edge.metrics.format_avg_latency(),
            edge.metrics.format_error_rate(),
            edge.status
        );
    }

    if let Some(chain) = graph.longest_call_chain() {
        println!(
            "\nLongest call chain ({}ms): {}",
            chain.total_latency_us / 1_000,
            chain.node_ids.join(" → ")
        );
    }
    Ok(())
}

async fn handle_bottlenecks(service: &FlowService, trace_id: &str, json: bool) -> Result<()> {
    let Some(findings) = service.bottlenecks(trace_id).await else {
        anyhow::bail!("Trace not found: {}", trace_id);
    };
    if json {
        return print_json(&findings);
    }

    if findings.is_empty() {
        println!("✅ No bottlenecks detected in {}", trace_id);
        return Ok(());
    }

    println!("⚠️  Bottlenecks in {} ({})", trace_id, findings.len());
    for finding in &findings {
        println!(
            "  [{:<8}] {:<24} {:?}: {}",
            finding.severity.as_str(),
            finding.service_name,
            finding.bottleneck_type,
            finding.description
        );
    }
    Ok(())
}

async fn handle_analyze(service: &FlowService, trace_id: &str, json: bool) -> Result<()> {
    let Some(analysis) = service.analyze(trace_id).await else {
        anyhow::bail!("Trace not found: {}", trace_id);
    };
    if json {
        return print_json(&analysis);
    }

    let explanation = &analysis.explanation.explanation;
    println!("🧠 Analysis of {}", trace_id);
    if let ExplanationSource::Fallback { reason } = &analysis.explanation.source {
        println!("(fallback explanation: {:?})", reason);
    }
    println!("\n{}", explanation.summary);
    if let Some(service_name) = &explanation.bottleneck_service {
        println!("\nBottleneck service: {}", service_name);
    }
    if let Some(root_cause) = &explanation.root_cause {
        println!("Root cause: {}", root_cause);
    }
    println!("Estimated impact: {}", explanation.estimated_impact.as_str());
    if !explanation.recommendations.is_empty() {
        println!("\nRecommendations:");
        for recommendation in &explanation.recommendations {
            println!("  • {}", recommendation);
        }
    }
    Ok(())
}

async fn handle_edges(
    service: &FlowService,
    filter: Option<&str>,
    limit: usize,
    lookback: Duration,
    json: bool,
) -> Result<()> {
    let edges = service.edge_profile(filter, limit, lookback).await;
    if json {
        return print_json(&edges);
    }

    println!("🔀 Edges ({})", edges.len());
    println!(
        "{:<24} {:<24} {:>8} {:>10} {:>10} {:>8} {}",
        "FROM", "TO", "CALLS", "AVG", "P95 MS", "ERRORS", "STATUS"
    );
    for edge in &edges {
        println!(
            "{:<24} {:<24} {:>8} {:>10} {:>10} {:>8} {:?}",
            edge.source_service,
            edge.target_service,
            edge.metrics.request_count,
            edge.metrics.format_avg_latency(),
            edge.metrics.p95_latency_ms(),
            edge.metrics.format_error_rate(),
            edge.status
        );
    }
    Ok(())
}

async fn handle_stats(service: &FlowService, lookback: Duration, json: bool) -> Result<()> {
    let stats = service.stats(lookback).await?;
    if json {
        return print_json(&stats);
    }

    println!("📊 Flow stats (last {} minutes)", lookback.as_secs() / 60);
    println!("• Total flows: {}", stats.total_flows);
    println!("• Successful: {}", stats.successful_flows);
    println!("• Failed: {}", stats.failed_flows);
    println!("• Services: {}", stats.service_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_saturate_instead_of_overflowing() {
        assert_eq!(minutes(30), Duration::from_secs(1800));
        assert_eq!(hours(2), Duration::from_secs(7200));
        assert_eq!(minutes(u64::MAX), Duration::from_secs(u64::MAX));
        assert_eq!(hours(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn backend_commands_parse() {
        let cli =
            Cli::try_parse_from(["flowscope", "span-names", "--service", "orders"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::SpanNames { ref service, json: false } if service == "orders"
        ));

        let cli =
            Cli::try_parse_from(["flowscope", "links", "--lookback", "15", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Links {
                lookback: 15,
                json: true
            }
        ));
    }
}
