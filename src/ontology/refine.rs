//! Advisory LLM pass over the default ontology.
//!
//! Every suggestion is checked against the schema on its own; a rejected
//! suggestion leaves the default in place for that item only.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

use super::{Attribute, Ontology};
use crate::llm::{complete_with_timeout, extract_json, LanguageModel};
use crate::schema::naming::is_valid_identifier;
use crate::schema::SchemaModel;

const SYSTEM_PROMPT: &str = "You design property-graph ontologies for relational databases. \
Reply with a single JSON object and nothing else.";

const MAX_SAMPLE_CHARS: usize = 300;

#[derive(Debug, Default, Deserialize)]
struct Suggestions {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    relationships: Vec<RelationshipSuggestion>,
    #[serde(default)]
    attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RelationshipSuggestion {
    from_table: String,
    from_column: String,
    to_table: String,
    #[serde(rename = "type")]
    rel_type: String,
}

/// Result of a refinement attempt
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub ontology: Ontology,
    pub applied: Vec<String>,
    pub rejected: Vec<String>,
    /// The model could not be used at all; `ontology` is the default.
    pub fell_back: bool,
}

fn build_prompt(ontology: &Ontology, schema: &SchemaModel) -> String {
    let mut prompt = String::from("Database tables:\n");
    for table in &schema.tables {
        let _ = writeln!(prompt, "\nTable {} ({} rows)", table.name, table.row_count);
        for column in &table.columns {
            let _ = writeln!(
                prompt,
                "  - {} {}{}",
                column.name,
                column.declared_type,
                if column.is_primary_key() { " PRIMARY KEY" } else { "" }
            );
        }
        if let Some(sample) = table.sample_rows.first() {
            let text = serde_json::to_string(sample).unwrap_or_default();
            let _ = writeln!(prompt, "  sample: {}", crate::llm::truncate_chars(&text, MAX_SAMPLE_CHARS));
        }
    }

    prompt.push_str("\nCurrent ontology:\n");
    for node in &ontology.nodes {
        let _ = writeln!(prompt, "  label {} <- table {}", node.label, node.table);
    }
    for rel in &ontology.relationships {
        let _ = writeln!(
            prompt,
            "  ({})-[:{}]->({}) via {}.{} -> {}.{}",
            rel.from_label, rel.rel_type, rel.to_label, rel.from_table, rel.from_column, rel.to_table, rel.to_column
        );
    }

    prompt.push_str(
        "\nSuggest clearer names. Respond with JSON of the form:\n\
         {\"labels\": {\"<table>\": \"<PascalCaseLabel>\"},\n \
         \"relationships\": [{\"from_table\": \"...\", \"from_column\": \"...\", \"to_table\": \"...\", \"type\": \"UPPER_SNAKE\"}],\n \
         \"attributes\": {\"<table>\": [\"<column>\", ...]}}\n\
         Only mention items you want to change. Attribute lists must keep the primary key columns.",
    );
    prompt
}

fn apply(mut ontology: Ontology, schema: &SchemaModel, suggestions: Suggestions) -> RefinementOutcome {
    let mut applied = Vec::new();
    let mut rejected = Vec::new();

    for (table, label) in suggestions.labels {
        let Some(current) = ontology.node_for_table(&table).map(|n| n.label.clone()) else {
            rejected.push(format!("label for unknown table {}", table));
            continue;
        };
        if !is_valid_identifier(&label) {
            rejected.push(format!("label '{}' for {} is not an identifier", label, table));
            continue;
        }
        if label == current {
            continue;
        }
        if ontology.nodes.iter().any(|n| n.label == label) {
            rejected.push(format!("label '{}' for {} is already used", label, table));
            continue;
        }
        ontology.rename_label(&current, &label);
        applied.push(format!("label {} -> {}", current, label));
    }

    for suggestion in suggestions.relationships {
        let rel_type = suggestion.rel_type.to_ascii_uppercase();
        if !is_valid_identifier(&rel_type) {
            rejected.push(format!("relationship type '{}' is not an identifier", suggestion.rel_type));
            continue;
        }
        let Some(idx) = ontology.relationships.iter().position(|r| {
            r.from_table == suggestion.from_table
                && r.from_column == suggestion.from_column
                && r.to_table == suggestion.to_table
        }) else {
            rejected.push(format!(
                "relationship {}.{} -> {} does not exist",
                suggestion.from_table, suggestion.from_column, suggestion.to_table
            ));
            continue;
        };

        let (from_label, to_label) = {
            let r = &ontology.relationships[idx];
            (r.from_label.clone(), r.to_label.clone())
        };
        let clashes = ontology
            .relationships
            .iter()
            .enumerate()
            .any(|(i, r)| i != idx && r.rel_type == rel_type && r.from_label == from_label && r.to_label == to_label);
        if clashes {
            rejected.push(format!("relationship type {} duplicates an existing one", rel_type));
            continue;
        }

        let rel = &mut ontology.relationships[idx];
        if rel.rel_type != rel_type {
            applied.push(format!("relationship {} -> {}", rel.rel_type, rel_type));
            rel.rel_type = rel_type;
        }
    }

    for (table_name, columns) in suggestions.attributes {
        let (Some(table), Some(node)) = (
            schema.table(&table_name),
            ontology.nodes.iter_mut().find(|n| n.table == table_name),
        ) else {
            rejected.push(format!("attributes for unknown table {}", table_name));
            continue;
        };

        let requested: HashSet<&str> = columns.iter().map(String::as_str).collect();
        if let Some(bad) = columns
            .iter()
            .find(|c| table.column(c).map(|col| col.is_binary()).unwrap_or(true))
        {
            rejected.push(format!("attribute {}.{} does not exist or is binary", table_name, bad));
            continue;
        }
        if let Some(missing) = node.key_columns.iter().find(|k| !requested.contains(k.as_str())) {
            rejected.push(format!("attributes for {} drop key column {}", table_name, missing));
            continue;
        }

        node.attributes = table
            .columns
            .iter()
            .filter(|c| requested.contains(c.name.as_str()))
            .map(|c| Attribute {
                column: c.name.clone(),
                property: c.name.clone(),
            })
            .collect();
        applied.push(format!("attributes for {}", table_name));
    }

    RefinementOutcome {
        ontology,
        applied,
        rejected,
        fell_back: false,
    }
}

/// Ask `llm` for naming improvements and apply the valid ones.
///
/// Errors, timeouts and unparseable replies return the default unchanged.
pub async fn refine_with_llm(
    ontology: Ontology,
    schema: &SchemaModel,
    llm: &dyn LanguageModel,
    timeout: Duration,
) -> RefinementOutcome {
    let prompt = build_prompt(&ontology, schema);

    let fallback = |ontology: Ontology, reason: String| {
        log::warn!("Ontology refinement skipped, keeping default: {}", reason);
        RefinementOutcome {
            ontology,
            applied: Vec::new(),
            rejected: vec![reason],
            fell_back: true,
        }
    };

    let reply = match complete_with_timeout(llm, SYSTEM_PROMPT, &prompt, timeout).await {
        Ok(reply) => reply,
        Err(e) => return fallback(ontology, e.to_string()),
    };

    let suggestions: Suggestions = match serde_json::from_str(extract_json(&reply)) {
        Ok(s) => s,
        Err(e) => return fallback(ontology, format!("unparseable refinement: {}", e)),
    };

    let outcome = apply(ontology, schema, suggestions);
    log::info!(
        "Ontology refinement: {} applied, {} rejected",
        outcome.applied.len(),
        outcome.rejected.len()
    );
    for reason in &outcome.rejected {
        log::debug!("Rejected refinement: {}", reason);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KgragError;
    use crate::llm::testing::ScriptedModel;
    use crate::ontology::generate_default;
    use crate::ontology::tests::shop_schema;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_valid_suggestions_applied() {
        let schema = shop_schema();
        let default = generate_default(&schema, 0.75);
        let llm = ScriptedModel::new(vec![
            r#"```json
{"labels": {"order_items": "LineItem"},
 "relationships": [{"from_table": "orders", "from_column": "customer_id", "to_table": "customers", "type": "placed_by"}],
 "attributes": {"customers": ["id"]}}
```"#,
        ]);

        let outcome = refine_with_llm(default, &schema, &llm, TIMEOUT).await;

        assert!(!outcome.fell_back);
        assert!(outcome.rejected.is_empty(), "{:?}", outcome.rejected);
        assert!(outcome.ontology.node_for_label("LineItem").is_some());
        let rel = outcome
            .ontology
            .relationships
            .iter()
            .find(|r| r.from_column == "order_id")
            .unwrap();
        assert_eq!(rel.from_label, "LineItem");
        assert!(outcome.ontology.relationships.iter().any(|r| r.rel_type == "PLACED_BY"));
        assert_eq!(outcome.ontology.node_for_table("customers").unwrap().attributes.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_suggestions_dropped_individually() {
        let schema = shop_schema();
        let default = generate_default(&schema, 0.75);
        let llm = ScriptedModel::new(vec![
            r#"{"labels": {"customers": "Order", "ghosts": "Ghost", "orders": "Purchase"},
                "relationships": [{"from_table": "orders", "from_column": "nope", "to_table": "customers", "type": "X"}],
                "attributes": {"customers": ["name"], "orders": ["id", "missing"]}}"#,
        ]);

        let outcome = refine_with_llm(default.clone(), &schema, &llm, TIMEOUT).await;

        // Only the Purchase rename survives
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.rejected.len(), 5);
        assert!(outcome.ontology.node_for_label("Purchase").is_some());
        assert_eq!(outcome.ontology.node_for_table("customers").unwrap().label, "Customer");
        assert_eq!(
            outcome.ontology.node_for_table("customers").unwrap().attributes,
            default.node_for_table("customers").unwrap().attributes
        );
    }

    #[tokio::test]
    async fn test_llm_failure_keeps_default() {
        let schema = shop_schema();
        let default = generate_default(&schema, 0.75);
        let llm = ScriptedModel::with_results(vec![Err(KgragError::Llm("down".to_string()))]);

        let outcome = refine_with_llm(default.clone(), &schema, &llm, TIMEOUT).await;

        assert!(outcome.fell_back);
        assert_eq!(outcome.ontology, default);
    }

    #[tokio::test]
    async fn test_unparseable_reply_keeps_default() {
        let schema = shop_schema();
        let default = generate_default(&schema, 0.75);
        let llm = ScriptedModel::new(vec!["I think the ontology looks great."]);

        let outcome = refine_with_llm(default.clone(), &schema, &llm, TIMEOUT).await;

        assert!(outcome.fell_back);
        assert_eq!(outcome.ontology, default);
    }
}
