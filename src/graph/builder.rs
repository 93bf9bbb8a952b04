//! Materializes the ontology into a fresh graph generation.
//!
//! Nodes for every label are written first, then relationships. Each batch
//! is one transaction, retried with exponential backoff.

use serde::Serialize;
use serde_json::Map;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{value_text, GraphNode, GraphRelationship, GraphStore};
use crate::config::BuildConfig;
use crate::error::{KgragError, Result};
use crate::ontology::{Ontology, OntologyNode};
use crate::schema::{RelationalSource, SourceRow};

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: &str = "|";

/// Counts from one graph build
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphBuildReport {
    pub generation: u64,
    pub nodes_written: usize,
    pub relationships_written: usize,
    /// Reference values with no matching target node.
    pub unresolved_references: usize,
    /// Rows skipped because a key column was null.
    pub rows_without_key: usize,
    pub nodes_by_label: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
}

/// Node key for a source row: key column values joined with `|`, or the
/// row id when the table has no primary key.
pub fn row_key(node: &OntologyNode, row: &SourceRow) -> Option<String> {
    if node.key_columns.is_empty() {
        return row.rowid.map(|id| id.to_string());
    }
    let mut parts = Vec::with_capacity(node.key_columns.len());
    for column in &node.key_columns {
        parts.push(value_text(row.values.get(column)?)?);
    }
    Some(parts.join(KEY_SEPARATOR))
}

async fn with_retry<T, F, Fut>(config: &BuildConfig, table: &str, batch: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < config.max_retries => {
                let delay = config.retry_backoff_ms.saturating_mul(1u64 << attempt.min(16));
                log::warn!(
                    "Batch {} of {} failed (attempt {}/{}), retrying in {}ms: {}",
                    batch,
                    table,
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(KgragError::GraphBuildFailed {
                    table: table.to_string(),
                    batch,
                    message: e.to_string(),
                })
            }
        }
    }
}

async fn read_page(
    source: &Arc<dyn RelationalSource>,
    table: &str,
    offset: usize,
    limit: usize,
) -> Result<Vec<SourceRow>> {
    let source = Arc::clone(source);
    let table = table.to_string();
    tokio::task::spawn_blocking(move || source.read_rows(&table, offset, limit))
        .await
        .map_err(|e| KgragError::Io(std::io::Error::other(format!("blocking task failed: {}", e))))?
}

/// Reference values seen in a relationship's source column
struct PendingEdges {
    rel_index: usize,
    edges: Vec<(String, String)>,
}

/// Write every node and relationship of `ontology` into `generation`.
pub async fn build_graph(
    source: Arc<dyn RelationalSource>,
    ontology: &Ontology,
    store: &GraphStore,
    generation: u64,
    config: &BuildConfig,
) -> Result<GraphBuildReport> {
    let started = Instant::now();
    let mut report = GraphBuildReport {
        generation,
        ..GraphBuildReport::default()
    };

    // target (table, column) -> value -> node keys
    let mut lookup: HashMap<(String, String), HashMap<String, Vec<String>>> = ontology
        .relationships
        .iter()
        .map(|r| ((r.to_table.clone(), r.to_column.clone()), HashMap::new()))
        .collect();
    let mut pending: Vec<PendingEdges> = (0..ontology.relationships.len())
        .map(|rel_index| PendingEdges {
            rel_index,
            edges: Vec::new(),
        })
        .collect();

    for node in &ontology.nodes {
        let mut offset = 0;
        let mut batch = 0;
        let mut written = 0;

        loop {
            let rows = with_retry(config, &node.table, batch, || {
                read_page(&source, &node.table, offset, config.batch_size)
            })
            .await?;
            let page_len = rows.len();

            let mut nodes = Vec::with_capacity(page_len);
            for row in &rows {
                let Some(key) = row_key(node, row) else {
                    report.rows_without_key += 1;
                    continue;
                };

                for ((table, column), values) in lookup.iter_mut() {
                    if table == &node.table {
                        if let Some(value) = row.values.get(column).and_then(value_text) {
                            values.entry(value).or_default().push(key.clone());
                        }
                    }
                }
                for pending_rel in pending.iter_mut() {
                    let rel = &ontology.relationships[pending_rel.rel_index];
                    if rel.from_table == node.table {
                        if let Some(value) = row.values.get(&rel.from_column).and_then(value_text) {
                            pending_rel.edges.push((key.clone(), value));
                        }
                    }
                }

                let mut properties = Map::new();
                for attribute in &node.attributes {
                    if let Some(value) = row.values.get(&attribute.column) {
                        if !value.is_null() {
                            properties.insert(attribute.property.clone(), value.clone());
                        }
                    }
                }
                nodes.push(GraphNode {
                    label: node.label.clone(),
                    key,
                    properties,
                });
            }

            if !nodes.is_empty() {
                written += with_retry(config, &node.table, batch, || {
                    store.upsert_nodes(generation, nodes.clone())
                })
                .await?;
                log::debug!("Wrote batch {} of {} ({} nodes)", batch, node.label, nodes.len());
            }

            if page_len < config.batch_size {
                break;
            }
            offset += page_len;
            batch += 1;
        }

        report.nodes_written += written;
        report.nodes_by_label.insert(node.label.clone(), written);
        log::info!("Wrote {} {} nodes", written, node.label);
    }

    for pending_rel in &pending {
        let rel = &ontology.relationships[pending_rel.rel_index];
        let targets = lookup.get(&(rel.to_table.clone(), rel.to_column.clone()));

        let mut edges = Vec::new();
        for (src_key, value) in &pending_rel.edges {
            match targets.and_then(|t| t.get(value)) {
                Some(keys) => {
                    for dst_key in keys {
                        edges.push(GraphRelationship {
                            rel_type: rel.rel_type.clone(),
                            src_label: rel.from_label.clone(),
                            src_key: src_key.clone(),
                            dst_label: rel.to_label.clone(),
                            dst_key: dst_key.clone(),
                        });
                    }
                }
                None => report.unresolved_references += 1,
            }
        }

        let mut written = 0;
        for (batch, chunk) in edges.chunks(config.batch_size).enumerate() {
            written += with_retry(config, &rel.from_table, batch, || {
                store.insert_relationships(generation, chunk.to_vec())
            })
            .await?;
        }
        report.relationships_written += written;
        log::info!(
            "Wrote {} {} relationships ({} -> {})",
            written,
            rel.rel_type,
            rel.from_label,
            rel.to_label
        );
    }

    if report.unresolved_references > 0 {
        log::warn!(
            "Skipped {} references with no matching target node",
            report.unresolved_references
        );
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}
