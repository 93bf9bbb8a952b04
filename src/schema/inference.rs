//! Implicit relationship inference.
//!
//! A column pair becomes an [`InferredLink`] only when both the naming signal
//! and the value-overlap signal clear their thresholds.

use std::collections::{HashMap, HashSet};

use super::naming::{column_stem, is_identifier_name, singularize};
use super::{Column, ForeignKey, InferredLink, LinkEvidence, RelationalSource, Table};
use crate::config::InferenceConfig;

/// Audit and timestamp columns never reference another table.
const EXCLUDED_COLUMNS: &[&str] = &[
    "created_at",
    "updated_at",
    "deleted_at",
    "modified_at",
    "timestamp",
    "date",
    "time",
];

/// Substrings marking a column as a data value rather than a reference.
const DATA_VALUE_PATTERNS: &[&str] = &[
    "price",
    "amount",
    "total",
    "quantity",
    "count",
    "status",
    "name",
    "description",
    "email",
    "phone",
];

const MIN_DISTINCT_VALUES: usize = 2;
const MIN_MATCHES: usize = 2;

fn is_candidate_column(column: &Column) -> bool {
    let lower = column.name.to_ascii_lowercase();
    !column.is_binary()
        && !EXCLUDED_COLUMNS.contains(&lower.as_str())
        && !DATA_VALUE_PATTERNS.iter().any(|p| lower.contains(p))
}

fn tokens(s: &str) -> HashSet<String> {
    s.split('_')
        .filter(|t| !t.is_empty())
        .map(|t| singularize(&t.to_ascii_lowercase()))
        .collect()
}

/// Naming signal in [0, 1] for `source_column` referencing `target_column`
/// of `target_table`.
pub fn name_similarity(source_column: &str, target_table: &str, target_column: &Column) -> f32 {
    let (stem, has_suffix) = column_stem(source_column);
    let table = target_table.to_ascii_lowercase();
    let singular_table = singularize(&table);
    let stem_matches_table = stem == table || stem == singular_table || singularize(&stem) == singular_table;

    if has_suffix && stem_matches_table && target_column.is_primary_key() {
        return 1.0;
    }
    if stem_matches_table {
        return 0.9;
    }
    if source_column.eq_ignore_ascii_case(&target_column.name)
        && (target_column.is_primary_key() || is_identifier_name(&target_column.name))
    {
        return 0.85;
    }

    let a = tokens(&stem);
    let b = tokens(&singular_table);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f32;
    let union = a.union(&b).count() as f32;
    intersection / union
}

/// Fraction of the source's distinct values present in the target, with the
/// number of matches. `None` when the source has too few distinct values.
pub fn value_overlap(source: &HashSet<String>, target: &HashSet<String>) -> Option<(f32, usize)> {
    if source.len() < MIN_DISTINCT_VALUES || target.is_empty() {
        return None;
    }
    let matches = source.intersection(target).count();
    Some((matches as f32 / source.len() as f32, matches))
}

struct ValueSampler<'a> {
    source: &'a dyn RelationalSource,
    limit: usize,
    cache: HashMap<(String, String), Option<HashSet<String>>>,
}

impl<'a> ValueSampler<'a> {
    fn values(&mut self, table: &str, column: &str) -> Option<&HashSet<String>> {
        let key = (table.to_string(), column.to_string());
        let source = self.source;
        let limit = self.limit;
        self.cache
            .entry(key)
            .or_insert_with(|| match source.distinct_values(table, column, limit) {
                Ok(values) => Some(values),
                Err(e) => {
                    log::debug!("Could not sample {}.{}: {}", table, column, e);
                    None
                }
            })
            .as_ref()
    }
}

/// Evaluate every cross-table column pair not already covered by a declared
/// foreign key. Both directions are considered. For each source column only
/// the highest-confidence link is kept.
pub fn infer_links(
    source: &dyn RelationalSource,
    tables: &[Table],
    explicit: &[ForeignKey],
    config: &InferenceConfig,
) -> Vec<InferredLink> {
    let declared: HashSet<(&str, &str)> = explicit
        .iter()
        .map(|fk| (fk.from_table.as_str(), fk.from_column.as_str()))
        .collect();

    let mut sampler = ValueSampler {
        source,
        limit: config.sample_limit,
        cache: HashMap::new(),
    };
    let mut best: HashMap<(String, String), InferredLink> = HashMap::new();

    for from in tables {
        for from_col in &from.columns {
            if from_col.is_primary_key()
                || !is_candidate_column(from_col)
                || declared.contains(&(from.name.as_str(), from_col.name.as_str()))
            {
                continue;
            }

            for to in tables.iter().filter(|t| t.name != from.name) {
                for to_col in &to.columns {
                    if !is_candidate_column(to_col) || !from_col.affinity().compatible_with(to_col.affinity()) {
                        continue;
                    }

                    let name_score = name_similarity(&from_col.name, &to.name, to_col);
                    if name_score < config.name_similarity_threshold {
                        continue;
                    }

                    let Some(from_values) = sampler.values(&from.name, &from_col.name).cloned() else {
                        continue;
                    };
                    let Some(to_values) = sampler.values(&to.name, &to_col.name) else {
                        continue;
                    };
                    let Some((overlap, matches)) = value_overlap(&from_values, to_values) else {
                        continue;
                    };
                    if overlap < config.value_overlap_threshold || matches < MIN_MATCHES {
                        continue;
                    }

                    let link = InferredLink {
                        from_table: from.name.clone(),
                        from_column: from_col.name.clone(),
                        to_table: to.name.clone(),
                        to_column: to_col.name.clone(),
                        confidence: (name_score + overlap) / 2.0,
                        evidence: LinkEvidence {
                            name_similarity: name_score,
                            value_overlap: overlap,
                            match_count: matches,
                        },
                    };
                    log::debug!(
                        "Inferred {}.{} -> {}.{} (name {:.2}, overlap {:.2}, {} matches)",
                        link.from_table,
                        link.from_column,
                        link.to_table,
                        link.to_column,
                        name_score,
                        overlap,
                        matches
                    );

                    let key = (from.name.clone(), from_col.name.clone());
                    match best.get(&key) {
                        Some(existing) if existing.confidence >= link.confidence => {}
                        _ => {
                            best.insert(key, link);
                        }
                    }
                }
            }
        }
    }

    let mut links: Vec<InferredLink> = best.into_values().collect();
    links.sort_by(|a, b| {
        (a.from_table.as_str(), a.from_column.as_str()).cmp(&(b.from_table.as_str(), b.from_column.as_str()))
    });
    links
}
