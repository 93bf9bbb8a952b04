//! SQLite-backed property graph store with generation-versioned rows.
//!
//! A build writes into a fresh generation; readers only ever see the
//! generation recorded as active, so a failed build never disturbs the
//! graph being served.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;

use super::{GraphNode, GraphRelationship, GraphStats};
use crate::db::Db;
use crate::error::{KgragError, Result};
use crate::ontology::Ontology;

const ACTIVE_GENERATION_KEY: &str = "active_generation";
const LAST_GENERATION_KEY: &str = "last_generation";

/// Async handle to the graph store
#[derive(Debug, Clone)]
pub struct GraphStore {
    db: Db,
}

impl GraphStore {
    /// Open (creating if needed) the store at `path` and apply migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Db::new(path);
        db.migrate().await?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn active_generation(&self) -> Result<Option<u64>> {
        self.db.with_connection(|conn| active_generation(conn)).await
    }

    /// Ontology recorded for `generation`.
    pub async fn ontology(&self, generation: u64) -> Result<Option<Ontology>> {
        self.db
            .with_connection(move |conn| {
                let text: Option<Option<String>> = conn
                    .query_row(
                        "SELECT ontology FROM graph_generations WHERE generation = ?1",
                        params![generation as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                match text.flatten() {
                    Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Start a new generation. Leftovers of builds that never published are
    /// removed first.
    pub async fn begin_generation(&self, source: &str, ontology: &Ontology) -> Result<u64> {
        let source = source.to_string();
        let ontology_json = serde_json::to_string(ontology)?;
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                // Numbers are never handed out twice, even after the rows of
                // a failed or pruned generation are gone.
                let issued: Option<String> = tx
                    .query_row(
                        "SELECT value FROM graph_meta WHERE key = ?1",
                        params![LAST_GENERATION_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                let issued = issued.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
                let max_row: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(generation), 0) FROM graph_generations",
                    [],
                    |row| row.get(0),
                )?;
                let next = issued.max(max_row) + 1;

                let stale: Vec<i64> = {
                    let mut stmt = tx.prepare("SELECT generation FROM graph_generations WHERE status != 'published'")?;
                    let rows = stmt
                        .query_map([], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<i64>, _>>()?;
                    rows
                };
                for generation in &stale {
                    delete_generation(&tx, *generation)?;
                }
                if !stale.is_empty() {
                    log::info!("Pruned {} unpublished graph generation(s)", stale.len());
                }

                tx.execute(
                    "INSERT INTO graph_meta (key, value) VALUES (?1, ?2) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![LAST_GENERATION_KEY, next.to_string()],
                )?;
                tx.execute(
                    "INSERT INTO graph_generations (generation, status, source, ontology, started_at) \
                     VALUES (?1, 'building', ?2, ?3, ?4)",
                    params![next, source, ontology_json, chrono::Utc::now().to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(next as u64)
            })
            .await
    }

    /// Merge `nodes` into `generation` in a single transaction.
    pub async fn upsert_nodes(&self, generation: u64, nodes: Vec<GraphNode>) -> Result<usize> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO graph_nodes (generation, label, node_key, properties) \
                         VALUES (?1, ?2, ?3, ?4) \
                         ON CONFLICT (generation, label, node_key) DO UPDATE SET properties = excluded.properties",
                    )?;
                    for node in &nodes {
                        let properties = serde_json::to_string(&node.properties)?;
                        stmt.execute(params![generation as i64, node.label, node.key, properties])?;
                    }
                }
                tx.commit()?;
                Ok(nodes.len())
            })
            .await
    }

    /// Insert relationships into `generation`; duplicates are ignored.
    /// Returns the number of new rows.
    pub async fn insert_relationships(&self, generation: u64, rels: Vec<GraphRelationship>) -> Result<usize> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR IGNORE INTO graph_relationships \
                         (generation, rel_type, src_label, src_key, dst_label, dst_key) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for rel in &rels {
                        inserted += stmt.execute(params![
                            generation as i64,
                            rel.rel_type,
                            rel.src_label,
                            rel.src_key,
                            rel.dst_label,
                            rel.dst_key
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await
    }

    /// Make `generation` the one readers see.
    pub async fn publish(&self, generation: u64) -> Result<()> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE graph_generations SET status = 'published', finished_at = ?2 \
                     WHERE generation = ?1 AND status = 'building'",
                    params![generation as i64, chrono::Utc::now().to_rfc3339()],
                )?;
                if updated == 0 {
                    return Err(KgragError::GraphBuildFailed {
                        table: String::new(),
                        batch: 0,
                        message: format!("generation {} is not being built", generation),
                    });
                }
                tx.execute(
                    "INSERT INTO graph_meta (key, value) VALUES (?1, ?2) \
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![ACTIVE_GENERATION_KEY, generation.to_string()],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn mark_failed(&self, generation: u64) -> Result<()> {
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE graph_generations SET status = 'failed', finished_at = ?2 \
                     WHERE generation = ?1 AND status = 'building'",
                    params![generation as i64, chrono::Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    /// Drop published generations older than the one preceding `active`.
    /// The immediate predecessor stays so queries that started before the
    /// swap can finish.
    pub async fn prune_superseded(&self, active: u64) -> Result<usize> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let old: Vec<i64> = {
                    let mut stmt = tx.prepare(
                        "SELECT generation FROM graph_generations \
                         WHERE status = 'published' AND generation < ?1 \
                         ORDER BY generation DESC",
                    )?;
                    let rows = stmt
                        .query_map(params![active as i64], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<i64>, _>>()?;
                    rows
                };
                let doomed: Vec<i64> = old.into_iter().skip(1).collect();
                for generation in &doomed {
                    delete_generation(&tx, *generation)?;
                }
                tx.commit()?;
                Ok(doomed.len())
            })
            .await
    }

    /// Run read-only work against one generation in a blocking task.
    pub async fn read<F, T>(&self, generation: u64, f: F) -> Result<T>
    where
        F: FnOnce(&GraphReader<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.db
            .with_connection(move |conn| {
                let reader = GraphReader::new(conn, generation);
                f(&reader)
            })
            .await
    }

    pub async fn stats(&self, generation: u64) -> Result<GraphStats> {
        self.read(generation, |r| r.stats()).await
    }
}

fn active_generation(conn: &Connection) -> Result<Option<u64>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM graph_meta WHERE key = ?1",
            params![ACTIVE_GENERATION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

fn delete_generation(conn: &Connection, generation: i64) -> Result<()> {
    conn.execute("DELETE FROM graph_nodes WHERE generation = ?1", params![generation])?;
    conn.execute("DELETE FROM graph_relationships WHERE generation = ?1", params![generation])?;
    conn.execute("DELETE FROM graph_generations WHERE generation = ?1", params![generation])?;
    Ok(())
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_node((label, key, properties): (String, String, String)) -> Result<GraphNode> {
    let properties: Map<String, Value> = serde_json::from_str(&properties)?;
    Ok(GraphNode { label, key, properties })
}

fn row_to_rel(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphRelationship> {
    Ok(GraphRelationship {
        rel_type: row.get(0)?,
        src_label: row.get(1)?,
        src_key: row.get(2)?,
        dst_label: row.get(3)?,
        dst_key: row.get(4)?,
    })
}

const REL_COLUMNS: &str = "rel_type, src_label, src_key, dst_label, dst_key";

/// Synchronous reads pinned to one generation
pub struct GraphReader<'a> {
    conn: &'a Connection,
    generation: i64,
}

impl<'a> GraphReader<'a> {
    pub fn new(conn: &'a Connection, generation: u64) -> Self {
        Self {
            conn,
            generation: generation as i64,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation as u64
    }

    pub fn node(&self, label: &str, key: &str) -> Result<Option<GraphNode>> {
        let row = self
            .conn
            .query_row(
                "SELECT label, node_key, properties FROM graph_nodes \
                 WHERE generation = ?1 AND label = ?2 AND node_key = ?3",
                params![self.generation, label, key],
                row_to_node,
            )
            .optional()?;
        row.map(decode_node).transpose()
    }

    /// Nodes of `label` ordered by key.
    pub fn nodes_by_label(&self, label: &str) -> Result<Vec<GraphNode>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT label, node_key, properties FROM graph_nodes \
             WHERE generation = ?1 AND label = ?2 ORDER BY node_key",
        )?;
        let rows = stmt
            .query_map(params![self.generation, label], row_to_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_node).collect()
    }

    /// Every node ordered by label, then key.
    pub fn all_nodes(&self) -> Result<Vec<GraphNode>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT label, node_key, properties FROM graph_nodes \
             WHERE generation = ?1 ORDER BY label, node_key",
        )?;
        let rows = stmt
            .query_map(params![self.generation], row_to_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_node).collect()
    }

    pub fn outgoing(&self, label: &str, key: &str) -> Result<Vec<GraphRelationship>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM graph_relationships \
             WHERE generation = ?1 AND src_label = ?2 AND src_key = ?3 \
             ORDER BY rel_type, dst_label, dst_key",
            REL_COLUMNS
        ))?;
        let rels = stmt
            .query_map(params![self.generation, label, key], row_to_rel)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rels)
    }

    pub fn incoming(&self, label: &str, key: &str) -> Result<Vec<GraphRelationship>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM graph_relationships \
             WHERE generation = ?1 AND dst_label = ?2 AND dst_key = ?3 \
             ORDER BY rel_type, src_label, src_key",
            REL_COLUMNS
        ))?;
        let rels = stmt
            .query_map(params![self.generation, label, key], row_to_rel)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rels)
    }

    pub fn all_relationships(&self) -> Result<Vec<GraphRelationship>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM graph_relationships WHERE generation = ?1 \
             ORDER BY rel_type, src_label, src_key, dst_label, dst_key",
            REL_COLUMNS
        ))?;
        let rels = stmt
            .query_map(params![self.generation], row_to_rel)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rels)
    }

    pub fn count_nodes(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM graph_nodes WHERE generation = ?1",
            params![self.generation],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Relationships whose source or target node is missing.
    pub fn dangling_relationships(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM graph_relationships r \
             WHERE r.generation = ?1 AND ( \
               NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.generation = r.generation \
                           AND n.label = r.src_label AND n.node_key = r.src_key) \
               OR NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.generation = r.generation \
                              AND n.label = r.dst_label AND n.node_key = r.dst_key))",
            params![self.generation],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        let mut stats = GraphStats {
            generation: self.generation as u64,
            ..GraphStats::default()
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT label, count(*) FROM graph_nodes WHERE generation = ?1 GROUP BY label ORDER BY label",
        )?;
        for row in stmt.query_map(params![self.generation], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (label, count) = row?;
            stats.total_nodes += count as u64;
            stats.nodes_by_label.insert(label, count as u64);
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT rel_type, count(*) FROM graph_relationships WHERE generation = ?1 \
             GROUP BY rel_type ORDER BY rel_type",
        )?;
        for row in stmt.query_map(params![self.generation], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })? {
            let (rel_type, count) = row?;
            stats.total_relationships += count as u64;
            stats.relationships_by_type.insert(rel_type, count as u64);
        }

        Ok(stats)
    }
}
