//! Read-only retrieval tools the agent chooses between.

mod filter;
mod handlers;

pub use filter::{FilterOp, PropertyFilter};
pub use handlers::dispatch;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::embeddings::Embedder;
use crate::error::{KgragError, Result};
use crate::graph::{parse_node_id, GraphStore};
use crate::index::VectorIndex;
use crate::ontology::Ontology;

pub const VECTOR_SEARCH: &str = "vector_search";
pub const CYPHER_QUERY: &str = "cypher_query";
pub const GET_NODE_DETAILS: &str = "get_node_details";
pub const FILTER_NODES: &str = "filter_nodes";
pub const GRAPH_STATS: &str = "graph_stats";

/// Tool definition shown to the planner
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One validated tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    VectorSearch {
        query: String,
        #[serde(default)]
        k: Option<usize>,
    },
    CypherQuery {
        query: String,
    },
    GetNodeDetails {
        #[serde(default)]
        label: Option<String>,
        #[serde(default)]
        key: Option<Value>,
        #[serde(default)]
        node_id: Option<String>,
    },
    FilterNodes {
        label: String,
        #[serde(default)]
        filters: Map<String, Value>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GraphStats {},
}

impl ToolCall {
    /// Build a call from a tool name and its JSON arguments. Missing
    /// arguments are treated as `{}`.
    pub fn from_parts(tool: &str, arguments: Option<Value>) -> Result<Self> {
        let arguments = match arguments {
            None | Some(Value::Null) => json!({}),
            Some(v) => v,
        };
        serde_json::from_value(json!({ "tool": tool, "arguments": arguments }))
            .map_err(|e| KgragError::QueryInvalid(format!("Invalid call to '{}': {}", tool, e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::VectorSearch { .. } => VECTOR_SEARCH,
            ToolCall::CypherQuery { .. } => CYPHER_QUERY,
            ToolCall::GetNodeDetails { .. } => GET_NODE_DETAILS,
            ToolCall::FilterNodes { .. } => FILTER_NODES,
            ToolCall::GraphStats {} => GRAPH_STATS,
        }
    }

    /// Arguments as the planner would write them.
    pub fn arguments(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("arguments").map(Value::take))
            .unwrap_or_else(|| json!({}))
    }

    /// Check required fields and ranges. Defaults are filled in, so two
    /// calls that differ only by an omitted default compare equal.
    pub fn validate(self, config: &AgentConfig) -> Result<Self> {
        match self {
            ToolCall::VectorSearch { query, k } => {
                if query.trim().is_empty() {
                    return Err(KgragError::QueryInvalid("vector_search needs a non-empty 'query'".into()));
                }
                let k = k.unwrap_or(config.default_top_k);
                if k == 0 || k > config.max_top_k {
                    return Err(KgragError::QueryInvalid(format!(
                        "vector_search 'k' must be between 1 and {}, got {}",
                        config.max_top_k, k
                    )));
                }
                Ok(ToolCall::VectorSearch { query, k: Some(k) })
            }
            ToolCall::CypherQuery { query } => {
                if query.trim().is_empty() {
                    return Err(KgragError::QueryInvalid("cypher_query needs a non-empty 'query'".into()));
                }
                Ok(ToolCall::CypherQuery { query })
            }
            ToolCall::GetNodeDetails { label, key, node_id } => {
                let key = match key {
                    Some(Value::Null) | None => None,
                    Some(Value::String(s)) => Some(Value::String(s)),
                    Some(Value::Number(n)) => Some(Value::Number(n)),
                    Some(other) => {
                        return Err(KgragError::QueryInvalid(format!(
                            "get_node_details 'key' must be a string or number, got {}",
                            other
                        )))
                    }
                };
                match (&label, &key, &node_id) {
                    (_, _, Some(id)) if parse_node_id(id).is_some() => {}
                    (_, _, Some(id)) => {
                        return Err(KgragError::QueryInvalid(format!(
                            "get_node_details 'node_id' must look like Label:key, got '{}'",
                            id
                        )))
                    }
                    (Some(l), Some(_), None) if !l.trim().is_empty() => {}
                    _ => {
                        return Err(KgragError::QueryInvalid(
                            "get_node_details needs 'label' and 'key', or 'node_id'".into(),
                        ))
                    }
                }
                Ok(ToolCall::GetNodeDetails { label, key, node_id })
            }
            ToolCall::FilterNodes { label, filters, limit } => {
                if label.trim().is_empty() {
                    return Err(KgragError::QueryInvalid("filter_nodes needs a 'label'".into()));
                }
                let limit = limit.unwrap_or(config.filter_limit);
                if limit == 0 {
                    return Err(KgragError::QueryInvalid("filter_nodes 'limit' must be at least 1".into()));
                }
                if let Some((property, value)) = filters.iter().find(|(_, v)| v.is_array() || v.is_object()) {
                    return Err(KgragError::QueryInvalid(format!(
                        "filter_nodes value for '{}' must be a scalar, got {}",
                        property, value
                    )));
                }
                Ok(ToolCall::FilterNodes {
                    label,
                    filters,
                    limit: Some(limit.min(config.filter_limit.max(1))),
                })
            }
            ToolCall::GraphStats {} => Ok(ToolCall::GraphStats {}),
        }
    }
}

/// Everything a tool may read. Built from one published snapshot, so graph
/// and index always belong to the same generation.
#[derive(Clone)]
pub struct ToolContext {
    pub store: GraphStore,
    pub generation: u64,
    pub index: Arc<VectorIndex>,
    pub ontology: Arc<Ontology>,
    pub embedder: Arc<dyn Embedder>,
    pub config: AgentConfig,
}

/// Tool catalogue with JSON parameter schemas.
pub fn tool_definitions(config: &AgentConfig) -> Vec<Tool> {
    vec![
        Tool {
            name: VECTOR_SEARCH.to_string(),
            description: "Semantic similarity search over every node's text. Returns the k nearest nodes \
                          (node_id, label, text, score) best first."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for, in natural language"},
                    "k": {
                        "type": "integer",
                        "description": "Number of results",
                        "default": config.default_top_k,
                        "minimum": 1,
                        "maximum": config.max_top_k
                    }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: CYPHER_QUERY.to_string(),
            description: format!(
                "Read-only Cypher: one MATCH path, optional WHERE with AND, RETURN (count, labels, type, \
                 DISTINCT, AS), ORDER BY, LIMIT. At most {} rows are returned.",
                config.cypher_row_limit
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Cypher query, e.g. MATCH (o:Order)-[:HAS_CUSTOMER]->(c:Customer) RETURN c.name, count(o)"}
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: GET_NODE_DETAILS.to_string(),
            description: "All attributes of one node plus its outgoing and incoming relationships.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string", "description": "Node label, e.g. Customer"},
                    "key": {"type": ["string", "integer"], "description": "Primary key value"},
                    "node_id": {"type": "string", "description": "Alternative to label+key: Label:key"}
                }
            }),
        },
        Tool {
            name: FILTER_NODES.to_string(),
            description: "Nodes of one label whose properties match every filter. A filter value is matched \
                          exactly, or may be an operator string: '>n', '<n', '>=n', '<=n', '!=v', '~substring'."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "label": {"type": "string"},
                    "filters": {
                        "type": "object",
                        "description": "property -> value or operator string",
                        "additionalProperties": {"type": ["string", "number", "boolean"]}
                    },
                    "limit": {"type": "integer", "minimum": 1, "maximum": config.filter_limit, "default": config.filter_limit}
                },
                "required": ["label"]
            }),
        },
        Tool {
            name: GRAPH_STATS.to_string(),
            description: "Node counts per label, relationship counts per type, and totals.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts_parses_each_tool() {
        let call = ToolCall::from_parts("vector_search", Some(json!({"query": "wireless audio", "k": 3}))).unwrap();
        assert_eq!(
            call,
            ToolCall::VectorSearch {
                query: "wireless audio".into(),
                k: Some(3)
            }
        );
        assert_eq!(ToolCall::from_parts("graph_stats", None).unwrap(), ToolCall::GraphStats {});
        assert_eq!(
            ToolCall::from_parts("graph_stats", Some(json!({}))).unwrap(),
            ToolCall::GraphStats {}
        );
        let call = ToolCall::from_parts("get_node_details", Some(json!({"label": "Customer", "key": 1}))).unwrap();
        assert_eq!(call.name(), GET_NODE_DETAILS);
    }

    #[test]
    fn test_from_parts_rejects_unknown_tool_and_missing_fields() {
        let err = ToolCall::from_parts("drop_graph", None).unwrap_err();
        assert_eq!(err.kind(), "query_invalid");
        assert!(ToolCall::from_parts("cypher_query", Some(json!({}))).is_err());
        assert!(ToolCall::from_parts("vector_search", Some(json!({"query": "x", "k": -1}))).is_err());
    }

    #[test]
    fn test_validate_fills_defaults_and_checks_ranges() {
        let config = AgentConfig::default();
        let call = ToolCall::VectorSearch {
            query: "lamps".into(),
            k: None,
        }
        .validate(&config)
        .unwrap();
        assert_eq!(
            call,
            ToolCall::VectorSearch {
                query: "lamps".into(),
                k: Some(5)
            }
        );

        for k in [0, 51] {
            let err = ToolCall::VectorSearch {
                query: "lamps".into(),
                k: Some(k),
            }
            .validate(&config)
            .unwrap_err();
            assert_eq!(err.kind(), "query_invalid");
        }
        assert!(ToolCall::CypherQuery { query: "  ".into() }.validate(&config).is_err());
    }

    #[test]
    fn test_validate_node_details_forms() {
        let config = AgentConfig::default();
        let by_id = ToolCall::GetNodeDetails {
            label: None,
            key: None,
            node_id: Some("Customer:1".into()),
        };
        assert!(by_id.validate(&config).is_ok());

        let by_key = ToolCall::GetNodeDetails {
            label: Some("Customer".into()),
            key: Some(json!(1)),
            node_id: None,
        };
        assert!(by_key.validate(&config).is_ok());

        let neither = ToolCall::GetNodeDetails {
            label: Some("Customer".into()),
            key: None,
            node_id: None,
        };
        assert!(neither.validate(&config).is_err());

        let bad_id = ToolCall::GetNodeDetails {
            label: None,
            key: None,
            node_id: Some("Customer".into()),
        };
        assert!(bad_id.validate(&config).is_err());
    }

    #[test]
    fn test_validate_filter_limit_clamped() {
        let config = AgentConfig::default();
        let call = ToolCall::FilterNodes {
            label: "Product".into(),
            filters: Map::new(),
            limit: Some(500),
        }
        .validate(&config)
        .unwrap();
        assert!(matches!(call, ToolCall::FilterNodes { limit: Some(20), .. }));

        let mut nested = Map::new();
        nested.insert("price".into(), json!({"gt": 3}));
        let err = ToolCall::FilterNodes {
            label: "Product".into(),
            filters: nested,
            limit: None,
        }
        .validate(&config)
        .unwrap_err();
        assert_eq!(err.kind(), "query_invalid");
    }

    #[test]
    fn test_arguments_roundtrip_and_definitions() {
        let call = ToolCall::CypherQuery {
            query: "MATCH (n) RETURN count(n)".into(),
        };
        assert_eq!(call.arguments(), json!({"query": "MATCH (n) RETURN count(n)"}));
        assert_eq!(ToolCall::GraphStats {}.arguments(), json!({}));

        let names: Vec<String> = tool_definitions(&AgentConfig::default())
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            names,
            vec![VECTOR_SEARCH, CYPHER_QUERY, GET_NODE_DETAILS, FILTER_NODES, GRAPH_STATS]
        );
    }
}
