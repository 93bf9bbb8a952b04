//! Bounded plan / dispatch / observe loop.
//!
//! ```text
//! Received -> Planning -> ToolDispatch -> Observing -> (Planning | Finalizing) -> Done | Failed
//! ```
//!
//! Each planning step is one LLM call that must produce a JSON decision. A
//! bad or late decision is retried once with the problem fed back; a second
//! failure ends the query. Tool errors of kind `query_invalid` become
//! observations the planner can react to.

mod prompts;
mod trace;

pub use trace::{AgentTurn, ReasoningTrace, Source};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AgentConfig, LlmConfig};
use crate::error::{ErrorInfo, KgragError, Result};
use crate::llm::{complete_with_timeout, extract_json, truncate_chars, LanguageModel};
use crate::tools::{dispatch, tool_definitions, ToolCall, ToolContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Received,
    Planning,
    ToolDispatch,
    Observing,
    Finalizing,
    Done,
    Failed,
}

/// Result of one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub tools_used: Vec<String>,
    pub reasoning: Vec<AgentTurn>,
    pub sources: Vec<Source>,
    /// The answer was assembled from observations, not by the model
    pub partial: bool,
    /// `Done` or `Failed`
    pub status: AgentState,
    pub error: Option<ErrorInfo>,
}

impl ChatResponse {
    fn done(answer: String, trace: ReasoningTrace) -> Self {
        Self {
            answer,
            tools_used: trace.tools_used(),
            sources: trace.sources(),
            reasoning: trace.turns,
            partial: false,
            status: AgentState::Done,
            error: None,
        }
    }

    pub(crate) fn failed(err: &KgragError, trace: ReasoningTrace) -> Self {
        Self {
            answer: trace.partial_answer(),
            tools_used: trace.tools_used(),
            sources: trace.sources(),
            reasoning: trace.turns,
            partial: true,
            status: AgentState::Failed,
            error: Some(ErrorInfo::from(err)),
        }
    }
}

/// A parsed planning decision
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    CallTool { call: ToolCall, rationale: String },
    Finish { rationale: String },
}

#[derive(Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    rationale: Option<String>,
}

/// Parse and validate a planner reply. Every problem is `PlanningInvalid`.
pub fn parse_decision(reply: &str, config: &AgentConfig) -> Result<Decision> {
    let invalid = |msg: String| KgragError::PlanningInvalid(msg);

    let raw: RawDecision = serde_json::from_str(extract_json(reply))
        .map_err(|e| invalid(format!("reply is not a JSON decision ({})", e)))?;
    let rationale = raw.rationale.unwrap_or_default();

    match raw.action.as_str() {
        "finish" => Ok(Decision::Finish { rationale }),
        "call_tool" => {
            let tool = raw
                .tool
                .ok_or_else(|| invalid("'call_tool' decision without a 'tool'".to_string()))?;
            let call = ToolCall::from_parts(&tool, raw.arguments)
                .and_then(|c| c.validate(config))
                .map_err(|e| invalid(e.to_string()))?;
            Ok(Decision::CallTool { call, rationale })
        }
        other => Err(invalid(format!(
            "unknown action '{}', expected 'call_tool' or 'finish'",
            other
        ))),
    }
}

/// Tool-selecting question answerer.
pub struct Agent {
    llm: Arc<dyn LanguageModel>,
    config: AgentConfig,
    llm_timeout: Duration,
    max_prompt_chars: usize,
}

impl Agent {
    pub fn new(llm: Arc<dyn LanguageModel>, config: AgentConfig, llm_timeout: Duration) -> Self {
        Self {
            llm,
            config,
            llm_timeout,
            max_prompt_chars: LlmConfig::default().max_input_chars,
        }
    }

    /// Bound planning and finalize prompts to what the model accepts.
    pub fn with_max_prompt_chars(mut self, max_chars: usize) -> Self {
        self.max_prompt_chars = max_chars;
        self
    }

    /// Planning call with a single re-plan on failure.
    async fn plan(&self, system: &str, query: &str, trace: &ReasoningTrace) -> Result<Decision> {
        let mut feedback: Option<String> = None;
        for attempt in 0..2 {
            let prompt = prompts::planning_prompt(query, &trace.turns, feedback.as_deref(), self.max_prompt_chars);
            let outcome = match complete_with_timeout(self.llm.as_ref(), system, &prompt, self.llm_timeout).await {
                Ok(reply) => parse_decision(&reply, &self.config),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(decision) => return Ok(decision),
                Err(e) if attempt == 0 => {
                    log::warn!("Planning attempt failed, re-planning: {}", e);
                    feedback = Some(e.to_string());
                }
                Err(KgragError::PlanningTimeout(secs)) => return Err(KgragError::PlanningTimeout(secs)),
                Err(KgragError::PlanningInvalid(msg)) => return Err(KgragError::PlanningInvalid(msg)),
                Err(other) => return Err(KgragError::PlanningInvalid(other.to_string())),
            }
        }
        Err(KgragError::PlanningInvalid("no usable decision".to_string()))
    }

    /// Answer `query` from the tools in `ctx`.
    pub async fn answer(&self, query: &str, ctx: &ToolContext) -> ChatResponse {
        let start = Instant::now();
        let system = prompts::planning_system(&tool_definitions(&self.config), &ctx.ontology, self.config.max_iterations);
        let mut trace = ReasoningTrace::default();
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut iterations = 0;
        let mut state = AgentState::Received;
        let mut pending: Option<(ToolCall, String)> = None;
        let mut observed: Option<AgentTurn> = None;

        log::info!("Agent received query: {}", query);

        let response = loop {
            log::debug!("Agent state: {:?}", state);
            state = match state {
                AgentState::Received => AgentState::Planning,

                AgentState::Planning => {
                    if iterations >= self.config.max_iterations {
                        let err = KgragError::IterationBudgetExceeded(self.config.max_iterations);
                        log::warn!("{}", err);
                        break ChatResponse::failed(&err, trace);
                    }
                    iterations += 1;
                    match self.plan(&system, query, &trace).await {
                        Ok(Decision::Finish { rationale }) => {
                            log::debug!("Planner finished: {}", rationale);
                            AgentState::Finalizing
                        }
                        Ok(Decision::CallTool { call, rationale }) => {
                            pending = Some((call, rationale));
                            AgentState::ToolDispatch
                        }
                        Err(e) => {
                            log::warn!("Planning failed: {}", e);
                            break ChatResponse::failed(&e, trace);
                        }
                    }
                }

                AgentState::ToolDispatch => {
                    let Some((call, rationale)) = pending.take() else {
                        break ChatResponse::failed(
                            &KgragError::PlanningInvalid("no tool call to dispatch".to_string()),
                            trace,
                        );
                    };
                    let cache_key = serde_json::to_string(&call).unwrap_or_default();

                    let turn = if let Some(&earlier) = seen.get(&cache_key) {
                        let previous = &trace.turns[earlier];
                        AgentTurn {
                            tool: call.name().to_string(),
                            arguments: call.arguments(),
                            observation: format!(
                                "Same call as step {}; result unchanged. {}",
                                earlier + 1,
                                previous.observation
                            ),
                            rationale,
                            is_error: previous.is_error,
                            cached: true,
                        }
                    } else {
                        log::debug!("Dispatching {} {}", call.name(), call.arguments());
                        let (observation, is_error) = match dispatch(ctx, &call).await {
                            Ok(value) => (value.to_string(), false),
                            Err(e) if e.is_recoverable_in_loop() => (format!("error: {}", e), true),
                            Err(e) => {
                                log::error!("Tool {} failed: {}", call.name(), e);
                                break ChatResponse::failed(&e, trace);
                            }
                        };
                        seen.insert(cache_key, trace.len());
                        AgentTurn {
                            tool: call.name().to_string(),
                            arguments: call.arguments(),
                            observation,
                            rationale,
                            is_error,
                            cached: false,
                        }
                    };
                    observed = Some(turn);
                    AgentState::Observing
                }

                AgentState::Observing => {
                    if let Some(mut turn) = observed.take() {
                        turn.observation =
                            truncate_chars(&turn.observation, self.config.observation_max_chars).to_string();
                        trace.push(turn);
                    }
                    AgentState::Planning
                }

                AgentState::Finalizing => {
                    let prompt = prompts::finalize_prompt(query, &trace.turns, self.max_prompt_chars);
                    match complete_with_timeout(self.llm.as_ref(), prompts::FINALIZE_SYSTEM, &prompt, self.llm_timeout)
                        .await
                    {
                        Ok(answer) => break ChatResponse::done(answer.trim().to_string(), trace),
                        Err(e) => {
                            log::warn!("Finalizing failed: {}", e);
                            break ChatResponse::failed(&e, trace);
                        }
                    }
                }

                AgentState::Done | AgentState::Failed => {
                    break ChatResponse::failed(
                        &KgragError::PlanningInvalid("agent loop re-entered a terminal state".to_string()),
                        trace,
                    );
                }
            };
        };

        log::info!(
            "Agent {:?} after {} step(s) in {:?}; tools: {:?}",
            response.status,
            response.reasoning.len(),
            start.elapsed(),
            response.tools_used
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, InferenceConfig};
    use crate::embeddings::{Embedder, HashingEmbedder};
    use crate::graph::{build_graph, GraphStore};
    use crate::index::build_index;
    use crate::llm::testing::ScriptedModel;
    use crate::ontology::generate_default;
    use crate::schema::test_support::{create_db, SHOP_SQL};
    use crate::schema::{extract_schema, RelationalSource, SqliteSource};
    use tempfile::TempDir;

    async fn shop_context(dir: &TempDir) -> ToolContext {
        let path = create_db(dir.path(), "shop.db", SHOP_SQL);
        let source: Arc<dyn RelationalSource> = Arc::new(SqliteSource::open(path.to_str().unwrap()).unwrap());
        let schema = extract_schema(source.as_ref(), &InferenceConfig::default()).unwrap();
        let ontology = generate_default(&schema, 0.75);
        let store = GraphStore::open(dir.path().join("graph.db")).await.unwrap();
        let generation = store.begin_generation("shop", &ontology).await.unwrap();
        build_graph(source, &ontology, &store, generation, &BuildConfig::default())
            .await
            .unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        let index = build_index(&store, generation, &ontology, embedder.as_ref(), 10)
            .await
            .unwrap();
        ToolContext {
            store,
            generation,
            index: Arc::new(index),
            ontology: Arc::new(ontology),
            embedder,
            config: AgentConfig::default(),
        }
    }

    fn agent(model: Arc<ScriptedModel>, config: AgentConfig) -> Agent {
        Agent::new(model, config, Duration::from_secs(5))
    }

    #[test]
    fn test_parse_decision_variants() {
        let config = AgentConfig::default();
        let decision = parse_decision(
            "```json\n{\"action\": \"call_tool\", \"tool\": \"graph_stats\", \"rationale\": \"count\"}\n```",
            &config,
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::CallTool {
                call: ToolCall::GraphStats {},
                rationale: "count".into()
            }
        );

        assert!(matches!(
            parse_decision(r#"{"action": "finish"}"#, &config).unwrap(),
            Decision::Finish { .. }
        ));

        for bad in [
            "I think we should count customers",
            r#"{"action": "explode"}"#,
            r#"{"action": "call_tool"}"#,
            r#"{"action": "call_tool", "tool": "vector_search", "arguments": {"query": "x", "k": 500}}"#,
        ] {
            let err = parse_decision(bad, &config).unwrap_err();
            assert_eq!(err.kind(), "planning_invalid", "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_count_question_uses_graph_stats() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"action": "call_tool", "tool": "graph_stats", "arguments": {}, "rationale": "count a whole label"}"#,
            r#"{"action": "finish", "rationale": "stats give the count"}"#,
            "We have 3 customers.",
        ]));

        let response = agent(model.clone(), AgentConfig::default())
            .answer("How many customers do we have?", &ctx)
            .await;

        assert_eq!(response.status, AgentState::Done);
        assert!(!response.partial);
        assert_eq!(response.tools_used, vec!["graph_stats"]);
        assert!(response.answer.contains('3'));
        assert!(response.reasoning[0].observation.contains("\"Customer\":3"));
        assert_eq!(response.sources.len(), 1);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[2].contains("\"Customer\":3"));
    }

    #[tokio::test]
    async fn test_invalid_cypher_is_observation_not_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"action": "call_tool", "tool": "cypher_query", "arguments": {"query": "MATCH (c:Customer) DELETE c"}}"#,
            r#"{"action": "call_tool", "tool": "cypher_query", "arguments": {"query": "MATCH (c:Customer) RETURN count(c)"}}"#,
            r#"{"action": "finish"}"#,
            "There are 3 customers.",
        ]));

        let response = agent(model, AgentConfig::default()).answer("Count customers", &ctx).await;

        assert_eq!(response.status, AgentState::Done);
        assert_eq!(response.reasoning.len(), 2);
        assert!(response.reasoning[0].is_error);
        assert!(response.reasoning[0].observation.starts_with("error: Invalid query"));
        assert_eq!(response.tools_used, vec!["cypher_query"]);
        assert_eq!(response.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_replan_once_then_fail() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        let recovers = Arc::new(ScriptedModel::new(vec![
            "not json at all",
            r#"{"action": "finish"}"#,
            "Nothing to look up.",
        ]));
        let response = agent(recovers.clone(), AgentConfig::default()).answer("hi", &ctx).await;
        assert_eq!(response.status, AgentState::Done);
        assert!(recovers.prompts.lock().unwrap()[1].contains("could not be used"));

        let gives_up = Arc::new(ScriptedModel::new(vec!["nope", "still nope"]));
        let response = agent(gives_up.clone(), AgentConfig::default()).answer("hi", &ctx).await;
        assert_eq!(response.status, AgentState::Failed);
        assert!(response.partial);
        assert_eq!(response.error.unwrap().kind, "planning_invalid");
        assert_eq!(gives_up.calls(), 2);
    }

    #[tokio::test]
    async fn test_planning_timeout() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let slow = Arc::new(ScriptedModel::new(vec!["{}", "{}"]).with_delay(Duration::from_millis(200)));

        let response = Agent::new(slow.clone(), AgentConfig::default(), Duration::from_millis(20))
            .answer("hi", &ctx)
            .await;
        assert_eq!(response.status, AgentState::Failed);
        assert_eq!(response.error.unwrap().kind, "planning_timeout");
        assert_eq!(slow.calls(), 2);
    }

    #[tokio::test]
    async fn test_loop_terminates_within_budget() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let config = AgentConfig {
            max_iterations: 3,
            ..AgentConfig::default()
        };
        let replies: Vec<String> = (0..10)
            .map(|i| {
                format!(
                    r#"{{"action": "call_tool", "tool": "vector_search", "arguments": {{"query": "item {}", "k": 1}}}}"#,
                    i
                )
            })
            .collect();
        let model = Arc::new(ScriptedModel::new(replies.iter().map(String::as_str).collect()));

        let response = agent(model.clone(), config).answer("loop forever", &ctx).await;
        assert_eq!(response.status, AgentState::Failed);
        assert!(response.partial);
        assert_eq!(response.error.unwrap().kind, "iteration_budget_exceeded");
        assert_eq!(response.reasoning.len(), 3);
        assert_eq!(model.calls(), 3);
        assert!(response.answer.starts_with("Partial answer"));
    }

    #[tokio::test]
    async fn test_repeated_call_reuses_observation() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"action": "call_tool", "tool": "vector_search", "arguments": {"query": "desk lamp"}}"#,
            r#"{"action": "call_tool", "tool": "vector_search", "arguments": {"query": "desk lamp", "k": 5}}"#,
            r#"{"action": "finish"}"#,
            "The Desk Lamp.",
        ]));

        let response = agent(model, AgentConfig::default()).answer("lamps?", &ctx).await;
        assert_eq!(response.status, AgentState::Done);
        assert_eq!(response.reasoning.len(), 2);
        assert!(!response.reasoning[0].cached);
        assert!(response.reasoning[1].cached);
        assert!(response.reasoning[1].observation.starts_with("Same call as step 1"));
        assert_eq!(response.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_observation_truncated() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let config = AgentConfig {
            observation_max_chars: 40,
            ..AgentConfig::default()
        };
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"action": "call_tool", "tool": "filter_nodes", "arguments": {"label": "Product"}}"#,
            r#"{"action": "finish"}"#,
            "Four products.",
        ]));

        let response = agent(model, config).answer("list products", &ctx).await;
        assert_eq!(response.reasoning[0].observation.chars().count(), 40);
    }

    #[tokio::test]
    async fn test_finalize_failure_gives_partial_answer() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let model = Arc::new(ScriptedModel::with_results(vec![
            Ok(r#"{"action": "call_tool", "tool": "graph_stats"}"#.to_string()),
            Ok(r#"{"action": "finish"}"#.to_string()),
            Err(KgragError::Llm("upstream 500".to_string())),
        ]));

        let response = agent(model, AgentConfig::default()).answer("How big is the graph?", &ctx).await;
        assert_eq!(response.status, AgentState::Failed);
        assert!(response.partial);
        assert_eq!(response.error.unwrap().kind, "llm");
        assert!(response.answer.contains("graph_stats"));
    }
}
