use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::truncate_chars;

const SOURCE_EXCERPT_CHARS: usize = 300;

/// One tool invocation and what it returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTurn {
    pub tool: String,
    pub arguments: Value,
    /// Tool output, truncated to the observation budget
    pub observation: String,
    pub rationale: String,
    #[serde(default)]
    pub is_error: bool,
    /// Re-used observation of an earlier identical call
    #[serde(default)]
    pub cached: bool,
}

/// Evidence backing an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub tool: String,
    pub excerpt: String,
}

/// Ordered turns of one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub turns: Vec<AgentTurn>,
}

impl ReasoningTrace {
    pub fn push(&mut self, turn: AgentTurn) {
        self.turns.push(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Distinct tool names in first-use order.
    pub fn tools_used(&self) -> Vec<String> {
        let mut used: Vec<String> = Vec::new();
        for turn in &self.turns {
            if !used.contains(&turn.tool) {
                used.push(turn.tool.clone());
            }
        }
        used
    }

    /// One source per successful, non-repeated turn.
    pub fn sources(&self) -> Vec<Source> {
        self.turns
            .iter()
            .filter(|t| !t.is_error && !t.cached)
            .map(|t| Source {
                tool: t.tool.clone(),
                excerpt: truncate_chars(&t.observation, SOURCE_EXCERPT_CHARS).to_string(),
            })
            .collect()
    }

    /// Answer assembled from observations alone, for queries that could not
    /// be finished by the model.
    pub fn partial_answer(&self) -> String {
        let useful: Vec<&AgentTurn> = self.turns.iter().filter(|t| !t.is_error).collect();
        if useful.is_empty() {
            return "No answer could be produced from the knowledge graph.".to_string();
        }
        let mut answer = format!("Partial answer from {} tool observation(s):", useful.len());
        for turn in useful {
            answer.push_str(&format!(
                "\n- {}: {}",
                turn.tool,
                truncate_chars(&turn.observation, SOURCE_EXCERPT_CHARS)
            ));
        }
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn(tool: &str, observation: &str, is_error: bool, cached: bool) -> AgentTurn {
        AgentTurn {
            tool: tool.to_string(),
            arguments: json!({}),
            observation: observation.to_string(),
            rationale: String::new(),
            is_error,
            cached,
        }
    }

    #[test]
    fn test_tools_used_and_sources() {
        let mut trace = ReasoningTrace::default();
        trace.push(turn("cypher_query", "error: Invalid query", true, false));
        trace.push(turn("graph_stats", "{\"total_nodes\":12}", false, false));
        trace.push(turn("cypher_query", "{\"rows\":[[3]]}", false, false));
        trace.push(turn("graph_stats", "{\"total_nodes\":12}", false, true));

        assert_eq!(trace.tools_used(), vec!["cypher_query", "graph_stats"]);
        let sources = trace.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].tool, "graph_stats");
        assert_eq!(sources[1].excerpt, "{\"rows\":[[3]]}");
    }

    #[test]
    fn test_partial_answer() {
        let mut trace = ReasoningTrace::default();
        assert!(trace.partial_answer().starts_with("No answer"));

        trace.push(turn("graph_stats", "Customer: 3", false, false));
        let answer = trace.partial_answer();
        assert!(answer.starts_with("Partial answer from 1"));
        assert!(answer.contains("graph_stats: Customer: 3"));
    }
}
