//! Flat nearest-neighbor index over node embeddings.

pub mod builder;
pub mod storage;

pub use builder::{build_index, source_text};
pub use storage::{generation_dir, load_index, prune_generation_dirs, save_index, IndexManifest};

use serde::{Deserialize, Serialize};

use crate::error::{KgragError, Result};

/// One embedded graph node. `position` is its slot in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub node_id: String,
    pub label: String,
    pub text: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub position: usize,
}

/// A scored search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub node_id: String,
    pub label: String,
    pub text: String,
    pub score: f32,
}

/// Exact inner-product index. Vectors are stored L2-normalized, so the
/// inner product is cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    generation: u64,
    dimensions: usize,
    records: Vec<EmbeddingRecord>,
}

impl VectorIndex {
    pub fn new(generation: u64, dimensions: usize) -> Self {
        Self {
            generation,
            dimensions,
            records: Vec::new(),
        }
    }

    /// Reassemble a persisted index. Vectors are taken as already normalized.
    pub(crate) fn from_records(generation: u64, dimensions: usize, records: Vec<EmbeddingRecord>) -> Self {
        Self {
            generation,
            dimensions,
            records,
        }
    }

    /// Append a record. Its position is assigned here.
    pub fn push(&mut self, node_id: String, label: String, text: String, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(KgragError::IndexBuildFailed(format!(
                "Embedding for {} has dimension {}, index expects {}",
                node_id,
                vector.len(),
                self.dimensions
            )));
        }
        crate::embeddings::normalize(&mut vector);
        let position = self.records.len();
        self.records.push(EmbeddingRecord {
            node_id,
            label,
            text,
            vector,
            position,
        });
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn record_at(&self, position: usize) -> Option<&EmbeddingRecord> {
        self.records.get(position)
    }

    /// Top `k` records by cosine similarity to `query`, best first. Ties keep
    /// index order. An empty index yields no hits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.records.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimensions {
            return Err(KgragError::Embedding(format!(
                "Query embedding has dimension {}, index expects {}",
                query.len(),
                self.dimensions
            )));
        }

        let mut query = query.to_vec();
        crate::embeddings::normalize(&mut query);

        let mut scored: Vec<(f32, usize)> = self
            .records
            .iter()
            .map(|r| (dot(&query, &r.vector), r.position))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, position)| {
                let record = &self.records[position];
                SearchHit {
                    node_id: record.node_id.clone(),
                    label: record.label.clone(),
                    text: record.text.clone(),
                    score,
                }
            })
            .collect())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VectorIndex {
        let mut index = VectorIndex::new(3, 3);
        index
            .push("A:1".into(), "A".into(), "one".into(), vec![1.0, 0.0, 0.0])
            .unwrap();
        index
            .push("A:2".into(), "A".into(), "two".into(), vec![0.0, 2.0, 0.0])
            .unwrap();
        index
            .push("B:1".into(), "B".into(), "three".into(), vec![1.0, 1.0, 0.0])
            .unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_score() {
        let index = sample();
        let hits = index.search(&[1.0, 0.1, 0.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.node_id.as_str()).collect();
        assert_eq!(ids, vec!["A:1", "B:1", "A:2"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!((hits[0].score - 0.995).abs() < 0.01);
    }

    #[test]
    fn test_search_k_bounds() {
        let index = sample();
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 1).unwrap().len(), 1);
        assert_eq!(index.search(&[1.0, 0.0, 0.0], 50).unwrap().len(), 3);
        assert!(index.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = VectorIndex::new(1, 8);
        assert!(index.is_empty());
        assert!(index.search(&[1.0; 8], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_checks() {
        let mut index = sample();
        let err = index
            .push("C:1".into(), "C".into(), "bad".into(), vec![1.0])
            .unwrap_err();
        assert_eq!(err.kind(), "index_build_failed");
        assert_eq!(index.search(&[1.0], 2).unwrap_err().kind(), "embedding");
    }

    #[test]
    fn test_positions_are_dense() {
        let index = sample();
        for (i, record) in index.records().iter().enumerate() {
            assert_eq!(record.position, i);
        }
        assert_eq!(index.record_at(1).unwrap().node_id, "A:2");
        assert!((dot(&index.records()[1].vector, &index.records()[1].vector) - 1.0).abs() < 1e-6);
    }
}
