//! Knowledge service: owns the build pipeline, readiness and the query entry.
//!
//! A build runs in one background task. It writes a new graph generation and
//! a new vector index next to the live ones, publishes the generation, then
//! swaps the whole snapshot. Queries clone the snapshot `Arc` when they start,
//! so graph and index always come from the same generation.

mod state;

pub use state::{BuildAck, BuildReport, BuildStatus, HealthReport, LastBuild, Snapshot};

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::{Agent, ChatResponse, ReasoningTrace};
use crate::config::Config;
use crate::embeddings::{self, Embedder};
use crate::error::{ErrorInfo, KgragError, Result};
use crate::graph::{build_graph, GraphStats, GraphStore};
use crate::index::{build_index, generation_dir, load_index, prune_generation_dirs, save_index};
use crate::llm::{LanguageModel, OpenAIChatClient, UnavailableModel};
use crate::ontology::{generate_default, refine_with_llm, Ontology};
use crate::schema::{extract_schema, RelationalSource, SqliteSource};
use crate::tools::{dispatch, ToolCall, ToolContext};
use state::LiveState;

fn join_error(e: tokio::task::JoinError) -> KgragError {
    KgragError::Io(std::io::Error::other(format!("blocking task failed: {}", e)))
}

struct Inner {
    config: Config,
    store: GraphStore,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    state: RwLock<LiveState>,
    build_lock: Arc<Mutex<()>>,
}

/// Cloneable handle to one knowledge graph.
#[derive(Clone)]
pub struct KnowledgeService {
    inner: Arc<Inner>,
}

impl KnowledgeService {
    /// Open the configured stores with the configured embedding and LLM
    /// providers, reloading the last published snapshot if it verifies.
    ///
    /// A chat client that cannot be configured (no API key) does not stop
    /// the service: builds skip refinement and `chat` fails with `llm`.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = embeddings::from_config(&config.embeddings)?;
        let llm: Arc<dyn LanguageModel> = match OpenAIChatClient::new(&config.llm) {
            Ok(client) => Arc::new(client),
            Err(KgragError::Config(reason)) => {
                log::warn!("Chat model unavailable, chat is disabled: {}", reason);
                Arc::new(UnavailableModel::new(reason))
            }
            Err(e) => return Err(e),
        };
        Self::with_components(config, embedder, llm).await
    }

    /// Like `open`, with explicit embedding and LLM providers.
    pub async fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let store = GraphStore::open(config.graph_db_path()).await?;
        let state = load_persisted(&store, &config, embedder.as_ref()).await?;
        if state.ready_snapshot().is_some() {
            log::info!("Loaded knowledge graph generation {:?}", state.graph_generation);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                embedder,
                llm,
                state: RwLock::new(state),
                build_lock: Arc::new(Mutex::new(())),
            }),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, LiveState> {
        self.inner.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, LiveState> {
        self.inner.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ready_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.read_state()
            .ready_snapshot()
            .ok_or_else(|| KgragError::NotReady("graph and vector index are not built".to_string()))
    }

    fn tool_context(&self, snapshot: &Snapshot) -> ToolContext {
        ToolContext {
            store: self.inner.store.clone(),
            generation: snapshot.generation,
            index: snapshot.index.clone(),
            ontology: snapshot.ontology.clone(),
            embedder: self.inner.embedder.clone(),
            config: self.inner.config.agent.clone(),
        }
    }

    /// Start a build of `connection` in the background. Rejected while
    /// another build is running.
    pub fn trigger_build(&self, connection: &str) -> BuildAck {
        let build_id = Uuid::new_v4().to_string();
        let guard = match self.inner.build_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!("Build request for {} rejected: a build is already running", connection);
                return BuildAck {
                    build_id,
                    accepted: false,
                    message: "A build is already running".to_string(),
                };
            }
        };

        self.write_state().last_build = Some(LastBuild {
            build_id: build_id.clone(),
            source: connection.to_string(),
            status: BuildStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            report: None,
            error: None,
        });

        let service = self.clone();
        let connection_owned = connection.to_string();
        let id = build_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result = service.run_build(&connection_owned).await;
            service.finish_build(&id, result);
        });

        log::info!("Build {} started for {}", build_id, connection);
        BuildAck {
            build_id,
            accepted: true,
            message: format!("Build started for {}", connection),
        }
    }

    /// Wait until no build is running.
    pub async fn wait_for_build(&self) {
        let _idle = self.inner.build_lock.lock().await;
    }

    fn finish_build(&self, build_id: &str, result: Result<BuildReport>) {
        let mut state = self.write_state();
        let Some(last) = state.last_build.as_mut().filter(|b| b.build_id == build_id) else {
            return;
        };
        last.finished_at = Some(Utc::now());
        match result {
            Ok(report) => {
                log::info!(
                    "Build {} published generation {} ({} nodes, {} relationships, {} vectors) in {}ms",
                    build_id,
                    report.generation,
                    report.graph.nodes_written,
                    report.graph.relationships_written,
                    report.vector_count,
                    report.elapsed_ms
                );
                last.status = BuildStatus::Succeeded;
                last.report = Some(report);
            }
            Err(e) => {
                log::error!("Build {} failed: {}", build_id, e);
                last.status = BuildStatus::Failed;
                last.error = Some(ErrorInfo::from(&e));
            }
        }
    }

    /// Full pipeline: schema, ontology, graph, index, publish.
    async fn run_build(&self, connection: &str) -> Result<BuildReport> {
        let started = Instant::now();
        let config = &self.inner.config;
        let mut phase_ms = BTreeMap::new();

        let phase = Instant::now();
        let connection_owned = connection.to_string();
        let source: Arc<dyn RelationalSource> = Arc::new(
            tokio::task::spawn_blocking(move || SqliteSource::open(&connection_owned))
                .await
                .map_err(join_error)??,
        );
        let schema = {
            let source = source.clone();
            let inference = config.inference.clone();
            tokio::task::spawn_blocking(move || extract_schema(source.as_ref(), &inference))
                .await
                .map_err(join_error)??
        };
        phase_ms.insert("schema".to_string(), phase.elapsed().as_millis() as u64);

        let phase = Instant::now();
        let mut ontology = generate_default(&schema, config.inference.relationship_confidence_threshold);
        let (mut applied, mut rejected) = (0, 0);
        let llm_missing = self.inner.llm.unavailable_reason();
        if let (true, Some(reason)) = (config.llm.refine_ontology, llm_missing) {
            log::info!("Skipping ontology refinement: {}", reason);
        } else if config.llm.refine_ontology {
            let outcome = refine_with_llm(
                ontology,
                &schema,
                self.inner.llm.as_ref(),
                Duration::from_secs(config.llm.timeout_secs),
            )
            .await;
            applied = outcome.applied.len();
            rejected = outcome.rejected.len();
            ontology = outcome.ontology;
        }
        phase_ms.insert("ontology".to_string(), phase.elapsed().as_millis() as u64);

        let generation = self.inner.store.begin_generation(connection, &ontology).await?;
        let published = match self.materialize(source, &ontology, generation, &mut phase_ms).await {
            Ok(published) => published,
            Err(e) => {
                if let Err(mark_err) = self.inner.store.mark_failed(generation).await {
                    log::warn!("Could not mark generation {} failed: {}", generation, mark_err);
                }
                return Err(e);
            }
        };
        let (graph, snapshot) = published;
        let vector_count = snapshot.index.len();

        {
            let mut state = self.write_state();
            state.graph_generation = Some(generation);
            state.snapshot = Some(Arc::new(snapshot));
        }

        if let Err(e) = self.inner.store.prune_superseded(generation).await {
            log::warn!("Pruning superseded graph generations failed: {}", e);
        }
        let index_dir = config.index_dir().to_path_buf();
        match tokio::task::spawn_blocking(move || prune_generation_dirs(&index_dir, generation)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("Pruning superseded vector indexes failed: {}", e),
            Err(e) => log::warn!("Pruning superseded vector indexes failed: {}", e),
        }

        Ok(BuildReport {
            generation,
            tables: schema.tables.len(),
            unreadable_tables: schema.unreadable.iter().map(|u| u.name.clone()).collect(),
            foreign_keys: schema.foreign_keys.len(),
            inferred_links: schema.inferred_links.len(),
            labels: ontology.labels().iter().map(|l| l.to_string()).collect(),
            relationship_types: ontology.relationship_types().iter().map(|t| t.to_string()).collect(),
            refinements_applied: applied,
            refinements_rejected: rejected,
            graph,
            vector_count,
            phase_ms,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Graph and index for `generation`, persisted and published. Nothing
    /// becomes visible to queries here.
    async fn materialize(
        &self,
        source: Arc<dyn RelationalSource>,
        ontology: &Ontology,
        generation: u64,
        phase_ms: &mut BTreeMap<String, u64>,
    ) -> Result<(crate::graph::GraphBuildReport, Snapshot)> {
        let config = &self.inner.config;
        let store = &self.inner.store;

        let phase = Instant::now();
        let graph = build_graph(source, ontology, store, generation, &config.build).await?;
        phase_ms.insert("graph".to_string(), phase.elapsed().as_millis() as u64);

        let phase = Instant::now();
        let index = build_index(
            store,
            generation,
            ontology,
            self.inner.embedder.as_ref(),
            config.embeddings.batch_size,
        )
        .await?;
        let node_count = store.read(generation, |r| r.count_nodes()).await?;
        if node_count as usize != index.len() {
            return Err(KgragError::IndexBuildFailed(format!(
                "{} nodes but {} embeddings in generation {}",
                node_count,
                index.len(),
                generation
            )));
        }

        let built_at = Utc::now();
        let index = Arc::new(index);
        {
            let index = index.clone();
            let dir = generation_dir(config.index_dir(), generation);
            let embedder = self.inner.embedder.name().to_string();
            tokio::task::spawn_blocking(move || save_index(&index, &dir, built_at, &embedder))
                .await
                .map_err(join_error)?
                .map_err(|e| KgragError::IndexBuildFailed(format!("Persisting index failed: {}", e)))?;
        }
        phase_ms.insert("index".to_string(), phase.elapsed().as_millis() as u64);

        store.publish(generation).await?;

        Ok((
            graph,
            Snapshot {
                generation,
                index,
                ontology: Arc::new(ontology.clone()),
                node_count,
                built_at,
            },
        ))
    }

    /// Answer a question. Never errors: failures come back as a `Failed`
    /// response with whatever partial answer exists.
    pub async fn chat(&self, query: &str) -> ChatResponse {
        if query.trim().is_empty() {
            return ChatResponse::failed(
                &KgragError::QueryInvalid("query is empty".to_string()),
                ReasoningTrace::default(),
            );
        }
        let snapshot = match self.ready_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => return ChatResponse::failed(&e, ReasoningTrace::default()),
        };
        if let Some(reason) = self.inner.llm.unavailable_reason() {
            return ChatResponse::failed(
                &KgragError::Llm(format!("LLM unavailable: {}", reason)),
                ReasoningTrace::default(),
            );
        }

        let agent = Agent::new(
            self.inner.llm.clone(),
            self.inner.config.agent.clone(),
            Duration::from_secs(self.inner.config.llm.timeout_secs),
        )
        .with_max_prompt_chars(self.inner.config.llm.max_input_chars);
        agent.answer(query, &self.tool_context(&snapshot)).await
    }

    /// Call one tool directly, outside the agent loop.
    pub async fn run_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        let snapshot = self.ready_snapshot()?;
        let call = ToolCall::from_parts(tool, Some(arguments))?.validate(&self.inner.config.agent)?;
        dispatch(&self.tool_context(&snapshot), &call).await
    }

    pub fn health(&self) -> HealthReport {
        let building = self.inner.build_lock.try_lock().is_err();
        let state = self.read_state();
        let snapshot = state.snapshot.clone();

        HealthReport {
            ready: state.ready_snapshot().is_some(),
            graph_built: state.graph_generation.is_some(),
            vector_index_built: snapshot.is_some(),
            building,
            generation: state.graph_generation,
            node_count: snapshot.as_ref().map_or(0, |s| s.node_count),
            vector_count: snapshot.as_ref().map_or(0, |s| s.index.len()),
            built_at: snapshot.as_ref().map(|s| s.built_at),
            last_build: state.last_build.clone(),
        }
    }

    /// Graph statistics of the live generation
    pub async fn stats(&self) -> Result<GraphStats> {
        let snapshot = self.ready_snapshot()?;
        self.inner.store.stats(snapshot.generation).await
    }
}

/// Rebuild the live state from disk. A graph whose index is missing or does
/// not verify is reported as built but not ready.
async fn load_persisted(store: &GraphStore, config: &Config, embedder: &dyn Embedder) -> Result<LiveState> {
    let Some(generation) = store.active_generation().await? else {
        return Ok(LiveState::default());
    };
    let mut state = LiveState {
        graph_generation: Some(generation),
        ..LiveState::default()
    };

    let dir = generation_dir(config.index_dir(), generation);
    let loaded = tokio::task::spawn_blocking(move || load_index(&dir))
        .await
        .map_err(join_error)?;
    let (index, manifest) = match loaded {
        Ok(Some(found)) => found,
        Ok(None) => {
            log::warn!("Graph generation {} has no persisted vector index", generation);
            return Ok(state);
        }
        Err(e) => {
            log::warn!("Persisted vector index rejected: {}", e);
            return Ok(state);
        }
    };

    if index.generation() != generation || index.dimensions() != embedder.dimensions() {
        log::warn!(
            "Persisted vector index (generation {}, {} dimensions) does not match graph generation {} / embedder {} dimensions",
            index.generation(),
            index.dimensions(),
            generation,
            embedder.dimensions()
        );
        return Ok(state);
    }

    let node_count = store.read(generation, |r| r.count_nodes()).await?;
    if node_count as usize != index.len() {
        log::warn!(
            "Persisted vector index has {} records for {} nodes; not ready",
            index.len(),
            node_count
        );
        return Ok(state);
    }

    let ontology = store.ontology(generation).await?.unwrap_or_default();
    state.snapshot = Some(Arc::new(Snapshot {
        generation,
        index: Arc::new(index),
        ontology: Arc::new(ontology),
        node_count,
        built_at: manifest.built_at,
    }));
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::embeddings::HashingEmbedder;
    use crate::llm::testing::ScriptedModel;
    use crate::schema::test_support::{create_db, EMPTY_SHOP_SQL, SHOP_SQL};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Hashing embedder that can be told to fail.
    struct SwitchableEmbedder {
        inner: HashingEmbedder,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Embedder for SwitchableEmbedder {
        async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(KgragError::Embedding("service down".into()));
            }
            self.inner.embed_batch(texts).await
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        fn name(&self) -> &str {
            "switchable"
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.kgrag.graph_db_path = dir.path().join("graph.db");
        config.kgrag.index_dir = dir.path().join("index");
        config.embeddings.dimensions = 128;
        config.llm.refine_ontology = false;
        config
    }

    async fn service(dir: &TempDir, replies: Vec<&str>) -> KnowledgeService {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));
        KnowledgeService::with_components(test_config(dir), embedder, Arc::new(ScriptedModel::new(replies)))
            .await
            .unwrap()
    }

    async fn build(service: &KnowledgeService, connection: &str) -> LastBuild {
        let ack = service.trigger_build(connection);
        assert!(ack.accepted);
        service.wait_for_build().await;
        let last = service.health().last_build.unwrap();
        assert_eq!(last.build_id, ack.build_id);
        last
    }

    fn shop(dir: &TempDir) -> String {
        let path = create_db(dir.path(), "shop.db", SHOP_SQL);
        format!("sqlite://{}", path.display())
    }

    #[tokio::test]
    async fn test_shop_scenario_build() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, vec![]).await;
        assert!(!service.health().ready);

        let last = build(&service, &shop(&dir)).await;
        assert_eq!(last.status, BuildStatus::Succeeded);
        let report = last.report.unwrap();
        assert_eq!(report.labels, vec!["Customer", "Order", "Product"]);
        assert_eq!(report.relationship_types.len(), 2);
        assert_eq!(report.vector_count, 12);

        let health = service.health();
        assert!(health.ready && health.graph_built && health.vector_index_built);
        assert!(!health.building);
        assert_eq!(health.generation, Some(1));
        assert_eq!(health.node_count, 12);
        assert_eq!(health.vector_count, 12);

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.nodes_by_label.len(), 3);
        assert_eq!(stats.nodes_by_label["Customer"], 3);
        assert_eq!(stats.nodes_by_label["Product"], 4);
        assert_eq!(stats.nodes_by_label["Order"], 5);
        assert_eq!(stats.relationships_by_type.len(), 2);
    }

    #[tokio::test]
    async fn test_how_many_customers() {
        let dir = TempDir::new().unwrap();
        let service = service(
            &dir,
            vec![
                r#"{"action": "call_tool", "tool": "graph_stats", "arguments": {}, "rationale": "whole-label count"}"#,
                r#"{"action": "finish", "rationale": "the stats answer it"}"#,
                "You have 3 customers.",
            ],
        )
        .await;
        build(&service, &shop(&dir)).await;

        let response = service.chat("How many customers do we have?").await;
        assert_eq!(response.status, AgentState::Done);
        assert!(response.tools_used.contains(&"graph_stats".to_string()));
        assert!(response.answer.contains('3'));
    }

    #[tokio::test]
    async fn test_wireless_audio_uses_vector_search() {
        let dir = TempDir::new().unwrap();
        let service = service(
            &dir,
            vec![
                r#"{"action": "call_tool", "tool": "vector_search", "arguments": {"query": "wireless audio", "k": 4}}"#,
                r#"{"action": "finish"}"#,
                "Wireless Headphones and Wireless Earbuds.",
            ],
        )
        .await;
        build(&service, &shop(&dir)).await;

        let response = service.chat("Find products related to wireless audio").await;
        assert_eq!(response.tools_used, vec!["vector_search"]);
        let hits: Vec<Value> = serde_json::from_str(&response.reasoning[0].observation).unwrap();
        assert!(!hits.is_empty());
        let scores: Vec<f64> = hits.iter().map(|h| h["score"].as_f64().unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!(hits[0]["node_id"].as_str().unwrap().starts_with("Product:"));
    }

    #[tokio::test]
    async fn test_zero_rows_gives_empty_search() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, vec![]).await;
        let path = create_db(dir.path(), "empty.db", EMPTY_SHOP_SQL);

        let last = build(&service, path.to_str().unwrap()).await;
        assert_eq!(last.status, BuildStatus::Succeeded);
        assert!(service.health().ready);
        assert_eq!(service.health().vector_count, 0);

        let hits = service
            .run_tool("vector_search", json!({"query": "anything"}))
            .await
            .unwrap();
        assert_eq!(hits, json!([]));
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, vec![]).await;
        let connection = shop(&dir);

        let node_ids = |service: &KnowledgeService| -> Vec<String> {
            let snapshot = service.ready_snapshot().unwrap();
            snapshot.index.records().iter().map(|r| r.node_id.clone()).collect()
        };

        build(&service, &connection).await;
        let first = node_ids(&service);
        build(&service, &connection).await;
        let second = node_ids(&service);

        assert_eq!(first, second);
        assert_eq!(service.health().generation, Some(2));
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 12);
        assert_eq!(stats.generation, 2);
    }

    #[tokio::test]
    async fn test_not_ready_before_build() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, vec![]).await;

        let response = service.chat("anything").await;
        assert_eq!(response.status, AgentState::Failed);
        assert_eq!(response.error.unwrap().kind, "not_ready");
        assert_eq!(service.stats().await.unwrap_err().kind(), "not_ready");
        assert_eq!(
            service.run_tool("graph_stats", json!({})).await.unwrap_err().kind(),
            "not_ready"
        );
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let embedder = Arc::new(SwitchableEmbedder {
            inner: HashingEmbedder::new(128),
            fail: AtomicBool::new(false),
        });
        let service = KnowledgeService::with_components(
            test_config(&dir),
            embedder.clone(),
            Arc::new(ScriptedModel::new(vec![])),
        )
        .await
        .unwrap();
        let connection = shop(&dir);
        build(&service, &connection).await;

        embedder.fail.store(true, Ordering::SeqCst);
        let last = build(&service, &connection).await;
        assert_eq!(last.status, BuildStatus::Failed);
        assert_eq!(last.error.unwrap().kind, "index_build_failed");

        let health = service.health();
        assert!(health.ready);
        assert_eq!(health.generation, Some(1));
        assert_eq!(service.stats().await.unwrap().total_nodes, 12);

        let missing = build(&service, "sqlite:///no/such/dir/missing.db").await;
        assert_eq!(missing.error.unwrap().kind, "source_unavailable");
        assert_eq!(service.health().generation, Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_build_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, vec![]).await;
        let connection = shop(&dir);

        let first = service.trigger_build(&connection);
        let second = service.trigger_build(&connection);
        assert!(first.accepted);
        assert!(!second.accepted);
        assert!(service.health().building);

        service.wait_for_build().await;
        let health = service.health();
        assert!(!health.building);
        assert_eq!(health.last_build.unwrap().build_id, first.build_id);
    }

    #[tokio::test]
    async fn test_open_reloads_persisted_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let service = service(&dir, vec![]).await;
            build(&service, &shop(&dir)).await;
        }

        let reopened = service(&dir, vec![]).await;
        let health = reopened.health();
        assert!(health.ready);
        assert_eq!(health.generation, Some(1));
        assert_eq!(health.vector_count, 12);
        assert!(health.last_build.is_none());
        assert_eq!(reopened.stats().await.unwrap().total_nodes, 12);
    }

    #[tokio::test]
    async fn test_open_with_corrupt_index_is_not_ready() {
        let dir = TempDir::new().unwrap();
        {
            let service = service(&dir, vec![]).await;
            build(&service, &shop(&dir)).await;
        }
        let vectors = generation_dir(&dir.path().join("index"), 1).join("vectors.bin");
        std::fs::write(&vectors, [1u8; 8]).unwrap();

        let reopened = service(&dir, vec![]).await;
        let health = reopened.health();
        assert!(health.graph_built);
        assert!(!health.vector_index_built);
        assert!(!health.ready);
    }

    #[tokio::test]
    async fn test_refinement_failure_falls_back() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.llm.refine_ontology = true;
        let service = KnowledgeService::with_components(
            config,
            Arc::new(HashingEmbedder::new(128)),
            Arc::new(ScriptedModel::new(vec![])),
        )
        .await
        .unwrap();

        let last = build(&service, &shop(&dir)).await;
        assert_eq!(last.status, BuildStatus::Succeeded);
        assert_eq!(last.report.unwrap().labels, vec!["Customer", "Order", "Product"]);
    }

    #[tokio::test]
    async fn test_open_without_llm_key_builds_offline() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.kgrag.graph_db_path = dir.path().join("graph.db");
        config.kgrag.index_dir = dir.path().join("index");
        config.llm.api_key_env = "KGRAG_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        assert!(config.llm.refine_ontology);

        let service = KnowledgeService::open(config).await.unwrap();
        let last = build(&service, &shop(&dir)).await;
        assert_eq!(last.status, BuildStatus::Succeeded);
        let report = last.report.unwrap();
        assert_eq!(report.refinements_applied, 0);
        assert_eq!(report.vector_count, 12);

        assert!(service.health().ready);
        assert_eq!(service.stats().await.unwrap().total_nodes, 12);

        let response = service.chat("How many customers do we have?").await;
        assert_eq!(response.status, AgentState::Failed);
        assert_eq!(response.error.unwrap().kind, "llm");
    }
}
