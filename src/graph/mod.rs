//! Property graph materialized from the relational source.

pub mod builder;
pub mod cypher;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use builder::{build_graph, GraphBuildReport};
pub use store::{GraphReader, GraphStore};

/// Stable node identifier: `Label:key`
pub fn node_id(label: &str, key: &str) -> String {
    format!("{}:{}", label, key)
}

/// Split a `Label:key` identifier. The key may itself contain `:`.
pub fn parse_node_id(id: &str) -> Option<(&str, &str)> {
    let (label, key) = id.split_once(':')?;
    if label.is_empty() || key.is_empty() {
        return None;
    }
    Some((label, key))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub label: String,
    pub key: String,
    pub properties: Map<String, Value>,
}

impl GraphNode {
    pub fn id(&self) -> String {
        node_id(&self.label, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub rel_type: String,
    pub src_label: String,
    pub src_key: String,
    pub dst_label: String,
    pub dst_key: String,
}

impl GraphRelationship {
    pub fn src_id(&self) -> String {
        node_id(&self.src_label, &self.src_key)
    }

    pub fn dst_id(&self) -> String {
        node_id(&self.dst_label, &self.dst_key)
    }
}

/// Node and relationship counts for one generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub generation: u64,
    pub nodes_by_label: BTreeMap<String, u64>,
    pub relationships_by_type: BTreeMap<String, u64>,
    pub total_nodes: u64,
    pub total_relationships: u64,
}

/// Render a cell value as the text used for keys and comparisons.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
