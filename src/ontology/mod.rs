//! Mapping from the relational schema to graph labels, relationship types and
//! node properties.

pub mod refine;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::schema::naming::{relationship_type, to_pascal_singular};
use crate::schema::SchemaModel;

pub use refine::{refine_with_llm, RefinementOutcome};

/// Projected column and the property name it is stored under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub column: String,
    pub property: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyNode {
    pub label: String,
    pub table: String,
    /// In table column order.
    pub attributes: Vec<Attribute>,
    /// Primary key columns in key order; empty means the row id is the key.
    pub key_columns: Vec<String>,
}

impl OntologyNode {
    pub fn property_for(&self, column: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.column == column)
            .map(|a| a.property.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ManyToOne,
    OneToOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationshipOrigin {
    ForeignKey,
    Inferred { confidence: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyRelationship {
    pub rel_type: String,
    pub from_label: String,
    pub from_table: String,
    pub from_column: String,
    pub to_label: String,
    pub to_table: String,
    pub to_column: String,
    pub cardinality: Cardinality,
    pub origin: RelationshipOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    pub nodes: Vec<OntologyNode>,
    pub relationships: Vec<OntologyRelationship>,
}

impl Ontology {
    pub fn node_for_table(&self, table: &str) -> Option<&OntologyNode> {
        self.nodes.iter().find(|n| n.table == table)
    }

    pub fn node_for_label(&self, label: &str) -> Option<&OntologyNode> {
        self.nodes.iter().find(|n| n.label == label)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.label.as_str()).collect()
    }

    pub fn relationship_types(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.relationships
            .iter()
            .map(|r| r.rel_type.as_str())
            .filter(|t| seen.insert(*t))
            .collect()
    }

    /// Rename a label everywhere it is referenced.
    pub(crate) fn rename_label(&mut self, from: &str, to: &str) {
        for node in self.nodes.iter_mut().filter(|n| n.label == from) {
            node.label = to.to_string();
        }
        for rel in self.relationships.iter_mut() {
            if rel.from_label == from {
                rel.from_label = to.to_string();
            }
            if rel.to_label == from {
                rel.to_label = to.to_string();
            }
        }
    }
}

fn unique_label(table: &str, taken: &HashSet<String>) -> String {
    let preferred = to_pascal_singular(table);
    if !taken.contains(&preferred) {
        return preferred;
    }

    // Collision: fall back to the raw (unsingularized) table name.
    let raw: String = table
        .split('_')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut chars = p.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    if !raw.is_empty() && !taken.contains(&raw) {
        return raw;
    }

    let mut n = 2;
    loop {
        let candidate = format!("{}{}", preferred, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Deterministic ontology for `schema`.
///
/// Inferred links become relationships only when their confidence reaches
/// `confidence_threshold`.
pub fn generate_default(schema: &SchemaModel, confidence_threshold: f32) -> Ontology {
    let mut taken = HashSet::new();
    let mut nodes = Vec::with_capacity(schema.tables.len());

    for table in &schema.tables {
        let label = unique_label(&table.name, &taken);
        taken.insert(label.clone());

        let key_columns: Vec<String> = table.primary_key().iter().map(|c| c.name.clone()).collect();
        let attributes = table
            .columns
            .iter()
            .filter(|c| !c.is_binary() || key_columns.contains(&c.name))
            .map(|c| Attribute {
                column: c.name.clone(),
                property: c.name.clone(),
            })
            .collect();

        nodes.push(OntologyNode {
            label,
            table: table.name.clone(),
            attributes,
            key_columns,
        });
    }

    let mut ontology = Ontology {
        nodes,
        relationships: Vec::new(),
    };

    let explicit = schema.foreign_keys.iter().map(|fk| {
        (
            fk.from_table.as_str(),
            fk.from_column.as_str(),
            fk.to_table.as_str(),
            fk.to_column.as_str(),
            RelationshipOrigin::ForeignKey,
        )
    });
    let inferred = schema
        .inferred_links
        .iter()
        .filter(|l| l.confidence >= confidence_threshold)
        .map(|l| {
            (
                l.from_table.as_str(),
                l.from_column.as_str(),
                l.to_table.as_str(),
                l.to_column.as_str(),
                RelationshipOrigin::Inferred {
                    confidence: l.confidence,
                },
            )
        });

    let mut relationships: Vec<OntologyRelationship> = Vec::new();
    let mut covered: HashSet<(String, String)> = HashSet::new();

    for (from_table, from_column, to_table, to_column, origin) in explicit.chain(inferred) {
        if !covered.insert((from_table.to_string(), from_column.to_string())) {
            continue;
        }
        let (Some(from), Some(to)) = (ontology.node_for_table(from_table), ontology.node_for_table(to_table)) else {
            continue;
        };

        let base = relationship_type(from_column);
        let mut rel_type = base.clone();
        let mut n = 2;
        while relationships
            .iter()
            .any(|r| r.rel_type == rel_type && r.from_label == from.label && r.to_label == to.label)
        {
            rel_type = format!("{}_{}", base, n);
            n += 1;
        }

        let sole_pk = schema
            .table(from_table)
            .map(|t| {
                let pk = t.primary_key();
                pk.len() == 1 && pk[0].name == from_column
            })
            .unwrap_or(false);

        relationships.push(OntologyRelationship {
            rel_type,
            from_label: from.label.clone(),
            from_table: from_table.to_string(),
            from_column: from_column.to_string(),
            to_label: to.label.clone(),
            to_table: to_table.to_string(),
            to_column: to_column.to_string(),
            cardinality: if sole_pk {
                Cardinality::OneToOne
            } else {
                Cardinality::ManyToOne
            },
            origin,
        });
    }

    ontology.relationships = relationships;

    log::info!(
        "Default ontology: {} labels, {} relationships",
        ontology.nodes.len(),
        ontology.relationships.len()
    );
    ontology
}
