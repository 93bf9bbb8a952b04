use std::time::Instant;

use super::VectorIndex;
use crate::embeddings::Embedder;
use crate::error::{KgragError, Result};
use crate::graph::{value_text, GraphNode, GraphStore};
use crate::ontology::Ontology;

/// Text embedded for a node: `"<Label> <key>. attr: value. attr: value"`.
///
/// Attributes follow ontology order; null and empty values are skipped.
pub fn source_text(node: &GraphNode, ontology: &Ontology) -> String {
    let mut text = format!("{} {}", node.label, node.key);

    let properties: Vec<&str> = match ontology.node_for_label(&node.label) {
        Some(node_def) => node_def.attributes.iter().map(|a| a.property.as_str()).collect(),
        None => node.properties.keys().map(String::as_str).collect(),
    };

    for property in properties {
        let rendered = node.properties.get(property).and_then(value_text);
        if let Some(value) = rendered.filter(|v| !v.trim().is_empty()) {
            text.push_str(&format!(". {}: {}", property, value));
        }
    }
    text
}

/// Embed every node of `generation` into a fresh in-memory index.
///
/// Nodes are read ordered by (label, key) so positions are stable across
/// rebuilds of the same graph.
pub async fn build_index(
    store: &GraphStore,
    generation: u64,
    ontology: &Ontology,
    embedder: &dyn Embedder,
    batch_size: usize,
) -> Result<VectorIndex> {
    let start = Instant::now();
    let nodes = store.read(generation, |reader| reader.all_nodes()).await?;
    let mut index = VectorIndex::new(generation, embedder.dimensions());

    if nodes.is_empty() {
        log::info!("Generation {} has no nodes; vector index is empty", generation);
        return Ok(index);
    }

    for (batch_no, batch) in nodes.chunks(batch_size.max(1)).enumerate() {
        let texts: Vec<String> = batch.iter().map(|n| source_text(n, ontology)).collect();
        let vectors = embedder
            .embed_batch(texts.clone())
            .await
            .map_err(|e| KgragError::IndexBuildFailed(format!("Embedding batch {} failed: {}", batch_no, e)))?;

        if vectors.len() != batch.len() {
            return Err(KgragError::IndexBuildFailed(format!(
                "Embedding batch {} returned {} vectors for {} nodes",
                batch_no,
                vectors.len(),
                batch.len()
            )));
        }

        for ((node, text), vector) in batch.iter().zip(texts).zip(vectors) {
            index.push(node.id(), node.label.clone(), text, vector)?;
        }
        log::debug!("Embedded batch {} ({} nodes)", batch_no, batch.len());
    }

    log::info!(
        "Vector index built: {} records, {} dimensions in {:?}",
        index.len(),
        index.dimensions(),
        start.elapsed()
    );
    Ok(index)
}
