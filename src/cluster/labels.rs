//! Label policies: which physical node labels are advertised, and under
//! which key

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kube::ResourceExt;

use super::resources::Node;

/// How the nodes' labels are folded into one advertised value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelAggregation {
    /// The first node carrying the label (and matching the filter) wins
    #[default]
    FirstMatch,
    /// "true" if at least one node matches, "false" otherwise
    AnyTrue,
    /// "true" if every physical node matches, "false" otherwise
    AllTrue,
}

/// One advertised label derived from node labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelPolicy {
    /// Label key read from the nodes
    pub source_key: String,

    /// Only nodes whose label has this value match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Key written into the advertisement; defaults to `source_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<String>,

    #[serde(default)]
    pub aggregation: LabelAggregation,
}

impl LabelPolicy {
    pub fn new(source_key: impl Into<String>) -> Self {
        Self {
            source_key: source_key.into(),
            value: None,
            target_key: None,
            aggregation: LabelAggregation::FirstMatch,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_target(mut self, target_key: impl Into<String>) -> Self {
        self.target_key = Some(target_key.into());
        self
    }

    pub fn with_aggregation(mut self, aggregation: LabelAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn target(&self) -> &str {
        self.target_key.as_deref().unwrap_or(&self.source_key)
    }

    /// The node's value for the source key, if the node matches
    fn matching_value<'a>(&self, node: &'a Node) -> Option<&'a str> {
        let value = node.labels().get(&self.source_key)?;
        match &self.value {
            Some(expected) if expected != value => None,
            _ => Some(value.as_str()),
        }
    }

    /// Boolean aggregations without a value filter look for a "true" label.
    fn matches_bool(&self, node: &Node) -> bool {
        match (self.matching_value(node), &self.value) {
            (Some(_), Some(_)) => true,
            (Some(value), None) => value.eq_ignore_ascii_case("true"),
            (None, _) => false,
        }
    }

    fn resolve(&self, nodes: &[Node]) -> Option<String> {
        match self.aggregation {
            LabelAggregation::FirstMatch => nodes
                .iter()
                .find_map(|node| self.matching_value(node))
                .map(str::to_string),
            LabelAggregation::AnyTrue => {
                Some(nodes.iter().any(|node| self.matches_bool(node)).to_string())
            }
            LabelAggregation::AllTrue => Some(
                (!nodes.is_empty() && nodes.iter().all(|node| self.matches_bool(node))).to_string(),
            ),
        }
    }
}

/// Resolve every policy against the physical nodes.
///
/// Policies are applied in order; when two policies write the same target
/// key the earlier one keeps it.
pub fn compute_labels(physical_nodes: &[Node], policies: &[LabelPolicy]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for policy in policies {
        if labels.contains_key(policy.target()) {
            continue;
        }
        if let Some(value) = policy.resolve(physical_nodes) {
            labels.insert(policy.target().to_string(), value);
        }
    }
    labels
}
