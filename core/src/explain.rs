//! Natural-language flow explanations.
//!
//! The text generator is an external collaborator behind [`FlowExplainer`].
//! [`explain_flow`] never fails: when the collaborator errors or answers with
//! something unparsable, a local explanation is synthesized from the primary
//! bottleneck and the outcome is tagged as a fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::bottleneck::{self, Bottleneck, Severity};
use crate::config::ExplainerConfig;
use crate::flow::ApiFlowGraph;

pub const SYSTEM_PROMPT: &str = r#"You are a Senior Site Reliability Engineer analyzing API call flows.
Given the following service call graph with latency and error metrics,
provide a concise analysis explaining:
1. A brief summary of the flow behavior
2. The primary bottleneck service (if any)
3. The most likely root cause
4. Specific, actionable recommendations to improve performance

Be specific and technical. Reference actual service names and metrics.

Output your response as valid JSON matching this exact structure:
{
    "summary": "Brief 1-2 sentence summary of the flow behavior",
    "bottleneckService": "Name of the bottleneck service or null",
    "rootCause": "Most likely root cause explanation",
    "recommendations": ["Specific action 1", "Specific action 2", "..."],
    "estimatedImpact": "high|medium|low"
}

Only output the JSON, no markdown formatting or additional text."#;

const FALLBACK_RECOMMENDATIONS: [&str; 3] = [
    "Monitor service health",
    "Review error logs",
    "Check resource utilization",
];

#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("Explainer transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Explainer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Explainer response had no content")]
    EmptyContent,

    #[error("Explainer is disabled")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedImpact {
    High,
    Medium,
    Low,
}

impl EstimatedImpact {
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Some(EstimatedImpact::High),
            "medium" => Some(EstimatedImpact::Medium),
            "low" => Some(EstimatedImpact::Low),
            _ => None,
        }
    }

    /// Critical and High findings both count as high impact.
    pub fn from_severity(severity: Option<Severity>) -> Self {
        match severity {
            Some(Severity::Critical) | Some(Severity::High) => EstimatedImpact::High,
            Some(Severity::Medium) => EstimatedImpact::Medium,
            Some(Severity::Low) | None => EstimatedImpact::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatedImpact::High => "high",
            EstimatedImpact::Medium => "medium",
            EstimatedImpact::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowExplanation {
    pub summary: String,
    pub bottleneck_service: Option<String>,
    pub root_cause: Option<String>,
    pub recommendations: Vec<String>,
    pub estimated_impact: EstimatedImpact,
}

/// Why a locally synthesized explanation was used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    Disabled,
    CollaboratorFailed(String),
    Unparsable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExplanationSource {
    Generated,
    Fallback { reason: FallbackReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationOutcome {
    pub explanation: FlowExplanation,
    pub source: ExplanationSource,
}

impl ExplanationOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ExplanationSource::Fallback { .. })
    }
}

/// Text-generation collaborator. Takes a system and a user prompt and returns
/// the raw completion.
#[async_trait]
pub trait FlowExplainer: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ExplainError>;
}

/// Explainer used when no collaborator is configured.
pub struct DisabledExplainer;

#[async_trait]
impl FlowExplainer for DisabledExplainer {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ExplainError> {
        Err(ExplainError::Disabled)
    }
}

/// Client for an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatibleExplainer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl OpenAiCompatibleExplainer {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExplainError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl FlowExplainer for OpenAiCompatibleExplainer {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ExplainError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.2,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.trim());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExplainError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ExplainError::EmptyContent)
    }
}

/// Build the configured explainer, or a [`DisabledExplainer`].
pub fn create_explainer(config: &ExplainerConfig) -> Result<Arc<dyn FlowExplainer>, ExplainError> {
    match (&config.base_url, config.enabled) {
        (Some(base_url), true) => {
            tracing::info!(model = %config.model, "Flow explainer: {}", base_url);
            Ok(Arc::new(OpenAiCompatibleExplainer::new(
                base_url,
                config.model.clone(),
                config.api_key.clone(),
                Duration::from_millis(config.timeout_ms),
            )?))
        }
        _ => {
            tracing::info!("Flow explainer disabled, using local fallback explanations");
            Ok(Arc::new(DisabledExplainer))
        }
    }
}

// Prompt --------------------------------------------------------------------

/// Markdown description of a flow graph and its findings.
pub fn build_user_prompt(graph: &ApiFlowGraph, findings: &[Bottleneck]) -> String {
    let mut out = String::new();
    out.push_str("## API Flow Analysis Request\n\n### Flow Overview\n");
    let _ = writeln!(out, "- **Trace ID**: {}", graph.trace_id);
    let _ = writeln!(out, "- **Root Service**: {}", graph.root_service);
    let _ = writeln!(out, "- **Root Endpoint**: {}", graph.root_endpoint);
    let _ = writeln!(out, "- **Total Duration**: {}ms", graph.total_duration_ms());
    let _ = writeln!(out, "- **Status**: {}", graph.status.as_str());
    let _ = writeln!(out, "- **Nodes**: {} services", graph.nodes.len());
    let _ = writeln!(out, "- **Edges**: {} calls", graph.edges.len());

    out.push_str("\n### Service Nodes\n");
    for node in &graph.nodes {
        let _ = writeln!(
            out,
            "- **{}** ({:?}): {:?}, latency={}ms, errorRate={:.1}%",
            node.service_name,
            node.node_type,
            node.health,
            node.avg_latency_us / 1_000,
            node.error_rate * 100.0
        );
    }

    out.push_str("\n### Call Edges\n");
    for edge in &graph.edges {
        let _ = writeln!(
            out,
            "- {} -> {}: latency={}ms, p95={}ms, errorRate={:.1}%, status={:?}",
            edge.source_service,
            edge.target_service,
            edge.metrics.avg_latency_ms(),
            edge.metrics.p95_latency_ms(),
            edge.metrics.error_rate * 100.0,
            edge.status
        );
    }

    out.push_str("\n### Detected Bottlenecks\n");
    if findings.is_empty() {
        out.push_str("No significant bottlenecks detected.\n");
    } else {
        for finding in findings {
            let _ = writeln!(
                out,
                "- **{}** ({:?}, {}): {}",
                finding.service_name,
                finding.bottleneck_type,
                finding.severity.as_str(),
                finding.description
            );
        }
    }

    out.push_str("\nPlease analyze this flow and provide recommendations.\n");
    out
}

/// Strip surrounding markdown code fences from a completion.
pub fn clean_response(response: &str) -> &str {
    let mut cleaned = response.trim();
    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExplanation {
    summary: Option<String>,
    bottleneck_service: Option<String>,
    root_cause: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    estimated_impact: Option<String>,
}

/// Parse a completion into an explanation. A missing or empty summary is an error;
/// an unrecognized impact label reads as medium.
pub fn parse_response(response: &str) -> Result<FlowExplanation, String> {
    let raw: RawExplanation =
        serde_json::from_str(clean_response(response)).map_err(|e| e.to_string())?;

    let summary = raw
        .summary
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| "missing summary".to_string())?;

    Ok(FlowExplanation {
        summary,
        bottleneck_service: raw
            .bottleneck_service
            .filter(|s| !s.is_empty() && s != "null"),
        root_cause: raw.root_cause,
        recommendations: raw.recommendations,
        estimated_impact: raw
            .estimated_impact
            .as_deref()
            .and_then(EstimatedImpact::parse)
            .unwrap_or(EstimatedImpact::Medium),
    })
}

/// Local explanation derived from the primary finding.
pub fn fallback_explanation(graph: &ApiFlowGraph, primary: Option<&Bottleneck>) -> FlowExplanation {
    FlowExplanation {
        summary: format!(
            "Flow from {} completed in {}ms with {} service calls. Status: {}",
            graph.root_service,
            graph.total_duration_ms(),
            graph.nodes.len(),
            graph.status.as_str()
        ),
        bottleneck_service: primary.map(|b| b.service_name.clone()),
        root_cause: Some(
            primary
                .map(|b| b.description.clone())
                .unwrap_or_else(|| "No significant issues detected".to_string()),
        ),
        recommendations: FALLBACK_RECOMMENDATIONS.iter().map(|r| r.to_string()).collect(),
        estimated_impact: EstimatedImpact::from_severity(primary.map(|b| b.severity)),
    }
}

/// Ask the collaborator to explain a flow, degrading to a local explanation.
pub async fn explain_flow(
    explainer: &dyn FlowExplainer,
    graph: &ApiFlowGraph,
    findings: &[Bottleneck],
) -> ExplanationOutcome {
    let fallback = |reason: FallbackReason| {
        let primary = bottleneck::primary(findings.to_vec());
        ExplanationOutcome {
            explanation: fallback_explanation(graph, primary.as_ref()),
            source: ExplanationSource::Fallback { reason },
        }
    };

    let user_prompt = build_user_prompt(graph, findings);
    match explainer.complete(SYSTEM_PROMPT, &user_prompt).await {
        Ok(response) => match parse_response(&response) {
            Ok(explanation) => ExplanationOutcome {
                explanation,
                source: ExplanationSource::Generated,
            },
            Err(e) => {
                tracing::warn!(trace_id = %graph.trace_id, "Unparsable flow explanation: {}", e);
                fallback(FallbackReason::Unparsable(e))
            }
        },
        Err(ExplainError::Disabled) => fallback(FallbackReason::Disabled),
        Err(e) => {
            tracing::warn!(trace_id = %graph.trace_id, "Flow explainer failed: {}", e);
            fallback(FallbackReason::CollaboratorFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::BottleneckType;
    use crate::flow::FlowStatus;
    use chrono::Utc;

    struct Scripted(Result<&'static str, ()>);

    #[async_trait]
    impl FlowExplainer for Scripted {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, ExplainError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(ExplainError::EmptyContent),
            }
        }
    }

    fn graph() -> ApiFlowGraph {
        ApiFlowGraph {
            trace_id: "t1".into(),
            root_service: "gateway".into(),
            root_endpoint: "get /checkout".into(),
            start_time: Utc::now(),
            total_duration_us: 1_234_000,
            nodes: Vec::new(),
            edges: Vec::new(),
            status: FlowStatus::PartialFailure,
            span_count: 3,
            correlated_incident_ids: Vec::new(),
        }
    }

    fn finding(severity: Severity) -> Bottleneck {
        Bottleneck {
            element_id: "a->b".into(),
            service_name: "payments".into(),
            bottleneck_type: BottleneckType::HighErrorRate,
            severity,
            description: "Error rate 100.0% exceeds threshold (5.0%)".into(),
        }
    }

    #[test]
    fn clean_strips_code_fences() {
        assert_eq!(clean_response("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_response("```\n{}\n```  "), "{}");
        assert_eq!(clean_response("  {} "), "{}");
    }

    #[test]
    fn parse_accepts_camel_case_json() {
        let parsed = parse_response(
            r#"```json
            {"summary": "Slow payments", "bottleneckService": "payments",
             "rootCause": "db pool", "recommendations": ["raise pool"], "estimatedImpact": "HIGH"}
            ```"#,
        )
        .unwrap();
        assert_eq!(parsed.summary, "Slow payments");
        assert_eq!(parsed.bottleneck_service.as_deref(), Some("payments"));
        assert_eq!(parsed.estimated_impact, EstimatedImpact::High);

        assert!(parse_response("not json").is_err());
        assert!(parse_response(r#"{"summary": ""}"#).is_err());
        let minimal = parse_response(r#"{"summary": "ok", "estimatedImpact": "huge"}"#).unwrap();
        assert_eq!(minimal.estimated_impact, EstimatedImpact::Medium);
        assert!(minimal.recommendations.is_empty());
    }

    #[test]
    fn prompt_lists_sections() {
        let prompt = build_user_prompt(&graph(), &[]);
        assert!(prompt.contains("### Flow Overview"));
        assert!(prompt.contains("- **Total Duration**: 1234ms"));
        assert!(prompt.contains("- **Status**: PARTIAL_FAILURE"));
        assert!(prompt.contains("No significant bottlenecks detected."));

        let prompt = build_user_prompt(&graph(), &[finding(Severity::Critical)]);
        assert!(prompt.contains("- **payments** (HighErrorRate, CRITICAL): Error rate"));
    }

    #[test]
    fn fallback_impact_mapping() {
        let g = graph();
        let critical = finding(Severity::Critical);
        let explanation = fallback_explanation(&g, Some(&critical));
        assert_eq!(explanation.estimated_impact, EstimatedImpact::High);
        assert_eq!(explanation.bottleneck_service.as_deref(), Some("payments"));
        assert_eq!(
            explanation.summary,
            "Flow from gateway completed in 1234ms with 0 service calls. Status: PARTIAL_FAILURE"
        );
        assert_eq!(explanation.recommendations.len(), 3);

        let medium = finding(Severity::Medium);
        assert_eq!(
            fallback_explanation(&g, Some(&medium)).estimated_impact,
            EstimatedImpact::Medium
        );
        let none = fallback_explanation(&g, None);
        assert_eq!(none.estimated_impact, EstimatedImpact::Low);
        assert_eq!(none.root_cause.as_deref(), Some("No significant issues detected"));
    }

    #[tokio::test]
    async fn outcome_tags_generated_and_fallback() {
        let g = graph();
        let findings = vec![finding(Severity::Medium), finding(Severity::Critical)];

        let generated = explain_flow(
            &Scripted(Ok(r#"{"summary": "fine", "estimatedImpact": "low"}"#)),
            &g,
            &findings,
        )
        .await;
        assert_eq!(generated.source, ExplanationSource::Generated);
        assert_eq!(generated.explanation.summary, "fine");

        let garbage = explain_flow(&Scripted(Ok("I think it is slow")), &g, &findings).await;
        assert!(matches!(
            garbage.source,
            ExplanationSource::Fallback {
                reason: FallbackReason::Unparsable(_)
            }
        ));
        assert_eq!(garbage.explanation.estimated_impact, EstimatedImpact::High);

        let failed = explain_flow(&Scripted(Err(())), &g, &findings).await;
        assert!(matches!(
            failed.source,
            ExplanationSource::Fallback {
                reason: FallbackReason::CollaboratorFailed(_)
            }
        ));

        let disabled = explain_flow(&DisabledExplainer, &g, &[]).await;
        assert_eq!(
            disabled.source,
            ExplanationSource::Fallback {
                reason: FallbackReason::Disabled
            }
        );
        assert!(disabled.is_fallback());
    }

    #[test]
    fn disabled_config_builds_disabled_explainer() {
        assert!(create_explainer(&ExplainerConfig::default()).is_ok());
    }
}
