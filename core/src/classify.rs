//! Heuristic node classification.
//!
//! Node types are inferred from substrings of the endpoint or service name.
//! Rules are evaluated in order and the first match wins, so the list can be
//! replaced or reordered from configuration without touching the builder.

use serde::{Deserialize, Serialize};

use crate::flow::NodeType;

/// Which span attribute a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Endpoint,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub field: MatchField,
    pub keywords: Vec<String>,
    pub node_type: NodeType,
}

impl ClassificationRule {
    pub fn new(field: MatchField, keywords: &[&str], node_type: NodeType) -> Self {
        Self {
            field,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            node_type,
        }
    }

    fn matches(&self, service_name: &str, endpoint: &str) -> bool {
        let haystack = match self.field {
            MatchField::Endpoint => endpoint.to_lowercase(),
            // service names are matched as reported
            MatchField::Service => service_name.to_string(),
        };
        self.keywords.iter().any(|k| haystack.contains(k.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct NodeClassifier {
    rules: Vec<ClassificationRule>,
}

impl NodeClassifier {
    /// Endpoint keywords are lowercased to match the lowercased endpoint.
    pub fn new(mut rules: Vec<ClassificationRule>) -> Self {
        for rule in rules.iter_mut().filter(|r| r.field == MatchField::Endpoint) {
            for keyword in &mut rule.keywords {
                *keyword = keyword.to_lowercase();
            }
        }
        Self { rules }
    }

    pub fn default_rules() -> Vec<ClassificationRule> {
        vec![
            ClassificationRule::new(
                MatchField::Endpoint,
                &["database", "jdbc", "mongo", "redis"],
                NodeType::Database,
            ),
            ClassificationRule::new(
                MatchField::Endpoint,
                &["kafka", "amqp", "rabbitmq"],
                NodeType::Messaging,
            ),
            ClassificationRule::new(
                MatchField::Endpoint,
                &["cache", "memcached"],
                NodeType::Cache,
            ),
            ClassificationRule::new(
                MatchField::Service,
                &["external", "third-party"],
                NodeType::External,
            ),
        ]
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify a node. The trace root is always `Entry`; an empty endpoint
    /// and an unmatched node are `Internal`.
    pub fn classify(&self, service_name: &str, endpoint: &str, is_root: bool) -> NodeType {
        if is_root {
            return NodeType::Entry;
        }
        if endpoint.is_empty() {
            return NodeType::Internal;
        }
        self.rules
            .iter()
            .find(|rule| rule.matches(service_name, endpoint))
            .map(|rule| rule.node_type)
            .unwrap_or(NodeType::Internal)
    }
}

impl Default for NodeClassifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}
