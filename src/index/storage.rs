//! On-disk vector index: `manifest.json` (records + checksum) beside
//! `vectors.bin` (little-endian f32, record order).
//!
//! Both files are written to temporaries and renamed into place. The blob is
//! renamed first; a crash between the two renames leaves a manifest whose
//! checksum no longer matches, which reload reports as corrupt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::{EmbeddingRecord, VectorIndex};
use crate::error::{KgragError, Result};

const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const FORMAT_VERSION: u32 = 1;
const GENERATION_PREFIX: &str = "generation-";

/// Persisted description of one index build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub generation: u64,
    pub dimensions: usize,
    pub count: usize,
    /// Hex SHA-256 of `vectors.bin`
    pub checksum: String,
    pub built_at: DateTime<Utc>,
    pub embedder: String,
    pub records: Vec<EmbeddingRecord>,
}

fn encode_vectors(index: &VectorIndex) -> Vec<u8> {
    let mut blob = Vec::with_capacity(index.len() * index.dimensions() * 4);
    for record in index.records() {
        for value in &record.vector {
            blob.extend_from_slice(&value.to_le_bytes());
        }
    }
    blob
}

fn decode_vectors(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

fn checksum(blob: &[u8]) -> String {
    format!("{:x}", Sha256::digest(blob))
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, dir.join(name)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Persist `index` under `dir`, replacing any previous index there.
pub fn save_index(index: &VectorIndex, dir: &Path, built_at: DateTime<Utc>, embedder: &str) -> Result<IndexManifest> {
    fs::create_dir_all(dir)?;

    let blob = encode_vectors(index);
    let manifest = IndexManifest {
        format_version: FORMAT_VERSION,
        generation: index.generation(),
        dimensions: index.dimensions(),
        count: index.len(),
        checksum: checksum(&blob),
        built_at,
        embedder: embedder.to_string(),
        records: index
            .records()
            .iter()
            .map(|r| EmbeddingRecord {
                vector: Vec::new(),
                ..r.clone()
            })
            .collect(),
    };

    write_atomic(dir, VECTORS_FILE, &blob)?;
    write_atomic(dir, MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;

    log::info!(
        "Vector index saved to {} (generation {}, {} records)",
        dir.display(),
        manifest.generation,
        manifest.count
    );
    Ok(manifest)
}

/// Directory holding the index built for `generation`.
pub fn generation_dir(base: &Path, generation: u64) -> PathBuf {
    base.join(format!("{}{}", GENERATION_PREFIX, generation))
}

/// Remove index directories other than `active` and the newest one before
/// it. Returns how many were removed.
pub fn prune_generation_dirs(base: &Path, active: u64) -> Result<usize> {
    if !base.exists() {
        return Ok(0);
    }
    let mut generations: Vec<u64> = Vec::new();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(generation) = name
            .to_str()
            .and_then(|n| n.strip_prefix(GENERATION_PREFIX))
            .and_then(|n| n.parse::<u64>().ok())
        {
            generations.push(generation);
        }
    }

    let predecessor = generations.iter().copied().filter(|g| *g < active).max();
    let mut removed = 0;
    for generation in generations {
        if generation == active || Some(generation) == predecessor {
            continue;
        }
        fs::remove_dir_all(generation_dir(base, generation))?;
        removed += 1;
    }
    if removed > 0 {
        log::info!("Pruned {} superseded vector index generation(s)", removed);
    }
    Ok(removed)
}

/// Reload a persisted index. `Ok(None)` when `dir` holds no index; an
/// `IndexBuildFailed` error when the files exist but do not verify.
pub fn load_index(dir: &Path) -> Result<Option<(VectorIndex, IndexManifest)>> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let vectors_path = dir.join(VECTORS_FILE);
    if !manifest_path.exists() || !vectors_path.exists() {
        return Ok(None);
    }

    let corrupt = |reason: String| KgragError::IndexBuildFailed(format!("Persisted index in {} is invalid: {}", dir.display(), reason));

    let manifest: IndexManifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", manifest.format_version)));
    }

    let blob = fs::read(&vectors_path)?;
    if checksum(&blob) != manifest.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }

    let values = decode_vectors(&blob).ok_or_else(|| corrupt("vector blob is not f32-aligned".to_string()))?;
    if manifest.records.len() != manifest.count || values.len() != manifest.count * manifest.dimensions {
        return Err(corrupt(format!(
            "expected {} vectors of dimension {}, found {} values",
            manifest.count,
            manifest.dimensions,
            values.len()
        )));
    }

    let mut records = Vec::with_capacity(manifest.count);
    if manifest.dimensions > 0 {
        for (position, (record, vector)) in manifest.records.iter().zip(values.chunks(manifest.dimensions)).enumerate() {
            if record.position != position {
                return Err(corrupt(format!("record {} claims position {}", record.node_id, record.position)));
            }
            records.push(EmbeddingRecord {
                vector: vector.to_vec(),
                ..record.clone()
            });
        }
    }

    let index = VectorIndex::from_records(manifest.generation, manifest.dimensions, records);
    Ok(Some((index, manifest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> VectorIndex {
        let mut index = VectorIndex::new(7, 2);
        index
            .push("Product:1".into(), "Product".into(), "Product 1".into(), vec![1.0, 0.0])
            .unwrap();
        index
            .push("Product:2".into(), "Product".into(), "Product 2".into(), vec![0.6, 0.8])
            .unwrap();
        index
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let index = sample();
        let saved = save_index(&index, dir.path(), Utc::now(), "hashing").unwrap();

        let (loaded, manifest) = load_index(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(manifest, saved);
        assert_eq!(manifest.generation, 7);
        assert_eq!(loaded.record_at(1).unwrap().node_id, "Product:2");
    }

    #[test]
    fn test_missing_index_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_index(dir.path()).unwrap().is_none());
        assert!(load_index(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_empty_index_roundtrip() {
        let dir = TempDir::new().unwrap();
        save_index(&VectorIndex::new(2, 16), dir.path(), Utc::now(), "hashing").unwrap();
        let (loaded, _) = load_index(dir.path()).unwrap().unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.dimensions(), 16);
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let dir = TempDir::new().unwrap();
        save_index(&sample(), dir.path(), Utc::now(), "hashing").unwrap();
        fs::write(dir.path().join(VECTORS_FILE), [0u8; 16]).unwrap();

        let err = load_index(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "index_build_failed");
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_prune_generation_dirs_keeps_active_and_predecessor() {
        let base = TempDir::new().unwrap();
        for generation in [1, 2, 4, 5] {
            save_index(&VectorIndex::new(generation, 2), &generation_dir(base.path(), generation), Utc::now(), "hashing")
                .unwrap();
        }
        fs::create_dir_all(base.path().join("unrelated")).unwrap();

        assert_eq!(prune_generation_dirs(base.path(), 4).unwrap(), 2);
        assert!(generation_dir(base.path(), 2).exists());
        assert!(generation_dir(base.path(), 4).exists());
        assert!(!generation_dir(base.path(), 1).exists());
        assert!(!generation_dir(base.path(), 5).exists());
        assert!(base.path().join("unrelated").exists());
        assert_eq!(prune_generation_dirs(&base.path().join("missing"), 1).unwrap(), 0);
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        save_index(&sample(), dir.path(), Utc::now(), "hashing").unwrap();
        save_index(&VectorIndex::new(8, 2), dir.path(), Utc::now(), "hashing").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(load_index(dir.path()).unwrap().unwrap().0.generation(), 8);
    }
}
