use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ErrorInfo;
use crate::graph::GraphBuildReport;
use crate::index::VectorIndex;
use crate::ontology::Ontology;

/// Graph generation and the vector index built from it, published together.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    pub index: Arc<VectorIndex>,
    pub ontology: Arc<Ontology>,
    pub node_count: u64,
    pub built_at: DateTime<Utc>,
}

/// Reply to `trigger_build`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAck {
    pub build_id: String,
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Succeeded,
    Failed,
}

/// Per-phase counts of a successful build
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub generation: u64,
    pub tables: usize,
    pub unreadable_tables: Vec<String>,
    pub foreign_keys: usize,
    pub inferred_links: usize,
    pub labels: Vec<String>,
    pub relationship_types: Vec<String>,
    pub refinements_applied: usize,
    pub refinements_rejected: usize,
    pub graph: GraphBuildReport,
    pub vector_count: usize,
    pub phase_ms: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
}

/// Outcome of the most recent build request
#[derive(Debug, Clone, Serialize)]
pub struct LastBuild {
    pub build_id: String,
    pub source: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<BuildReport>,
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Graph and vector index are both built and belong to the same generation
    pub ready: bool,
    pub graph_built: bool,
    pub vector_index_built: bool,
    pub building: bool,
    pub generation: Option<u64>,
    pub node_count: u64,
    pub vector_count: usize,
    pub built_at: Option<DateTime<Utc>>,
    pub last_build: Option<LastBuild>,
}

/// Mutable service state. Readers clone the snapshot `Arc` and never hold
/// the lock across awaits.
#[derive(Debug, Default)]
pub(crate) struct LiveState {
    pub snapshot: Option<Arc<Snapshot>>,
    /// Published graph generation, known even when its index failed to load
    pub graph_generation: Option<u64>,
    pub last_build: Option<LastBuild>,
}

impl LiveState {
    pub fn ready_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .as_ref()
            .filter(|s| Some(s.generation) == self.graph_generation && s.index.generation() == s.generation)
            .cloned()
    }
}
