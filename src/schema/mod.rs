//! Relational schema model extracted from a source database.
//!
//! Extraction reads the catalog through a [`RelationalSource`], records tables
//! whose metadata cannot be read instead of aborting, and runs implicit
//! relationship inference over the readable tables.

pub mod inference;
pub mod naming;
pub mod source;

use serde::{Deserialize, Serialize};

use crate::config::InferenceConfig;
use crate::error::{KgragError, Result};

pub use inference::infer_links;
pub use source::{RelationalSource, SourceRow, SqliteSource};

/// SQLite-style type affinity derived from a declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Affinity rules in the order SQLite applies them.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    /// Whether values of the two affinities can reference each other.
    pub fn compatible_with(self, other: Affinity) -> bool {
        match (self, other) {
            (a, b) if a == b => true,
            (Affinity::Integer, Affinity::Numeric) | (Affinity::Numeric, Affinity::Integer) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    /// 1-based position in the primary key, 0 when not part of it.
    pub pk_ordinal: usize,
}

impl Column {
    pub fn is_primary_key(&self) -> bool {
        self.pk_ordinal > 0
    }

    pub fn affinity(&self) -> Affinity {
        Affinity::from_declared(&self.declared_type)
    }

    /// Binary columns are never projected as graph properties.
    pub fn is_binary(&self) -> bool {
        self.declared_type.to_ascii_uppercase().contains("BLOB")
    }
}

/// Declared foreign key edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub row_count: u64,
    /// A couple of example rows, used to give the refinement prompt context.
    #[serde(default)]
    pub sample_rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns ordered by key position.
    pub fn primary_key(&self) -> Vec<&Column> {
        let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        pk.sort_by_key(|c| c.pk_ordinal);
        pk
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(Column::is_primary_key)
    }
}

/// Scores backing an inferred link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkEvidence {
    pub name_similarity: f32,
    pub value_overlap: f32,
    pub match_count: usize,
}

/// Relationship hypothesized from naming and value heuristics. Never merged
/// into the declared foreign keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredLink {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub confidence: f32,
    pub evidence: LinkEvidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableTable {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaModel {
    pub tables: Vec<Table>,
    pub foreign_keys: Vec<ForeignKey>,
    pub inferred_links: Vec<InferredLink>,
    pub unreadable: Vec<UnreadableTable>,
}

impl SchemaModel {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.row_count).sum()
    }
}

const SAMPLE_ROWS: usize = 2;

/// Read the full schema model from `source`.
///
/// Fails with `SourceUnavailable` only when the table list itself cannot be
/// read; individual table failures land in `unreadable`.
pub fn extract_schema(source: &dyn RelationalSource, config: &InferenceConfig) -> Result<SchemaModel> {
    let table_names = source.list_tables().map_err(|e| match e {
        KgragError::SourceUnavailable(_) => e,
        other => KgragError::SourceUnavailable(other.to_string()),
    })?;

    log::info!("Extracting schema for {} tables", table_names.len());

    let mut tables = Vec::with_capacity(table_names.len());
    let mut unreadable = Vec::new();

    for name in table_names {
        match read_table(source, &name) {
            Ok(table) => {
                log::debug!(
                    "Table {}: {} columns, {} rows, {} foreign keys",
                    table.name,
                    table.columns.len(),
                    table.row_count,
                    table.foreign_keys.len()
                );
                tables.push(table);
            }
            Err(e) => {
                log::warn!("Skipping unreadable table {}: {}", name, e);
                unreadable.push(UnreadableTable {
                    name,
                    reason: e.to_string(),
                });
            }
        }
    }

    resolve_foreign_key_targets(&mut tables);

    let foreign_keys: Vec<ForeignKey> = tables
        .iter()
        .flat_map(|t| t.foreign_keys.iter().cloned())
        .collect();

    let inferred_links = infer_links(source, &tables, &foreign_keys, config);

    log::info!(
        "Schema extracted: {} tables, {} foreign keys, {} inferred links, {} unreadable",
        tables.len(),
        foreign_keys.len(),
        inferred_links.len(),
        unreadable.len()
    );

    Ok(SchemaModel {
        tables,
        foreign_keys,
        inferred_links,
        unreadable,
    })
}

fn read_table(source: &dyn RelationalSource, name: &str) -> Result<Table> {
    let columns = source.columns(name)?;
    if columns.is_empty() {
        return Err(KgragError::SourceUnavailable(format!("table {} has no readable columns", name)));
    }
    let foreign_keys = source.foreign_keys(name)?;
    let row_count = source.row_count(name)?;
    let sample_rows = source
        .sample_rows(name, SAMPLE_ROWS)
        .unwrap_or_else(|e| {
            log::debug!("No sample rows for {}: {}", name, e);
            Vec::new()
        });

    Ok(Table {
        name: name.to_string(),
        columns,
        foreign_keys,
        row_count,
        sample_rows,
    })
}

/// Foreign keys declared without a target column reference the target's
/// primary key. Keys that still cannot be resolved, or that point at an
/// unreadable table, are dropped.
fn resolve_foreign_key_targets(tables: &mut [Table]) {
    let pk_by_table: std::collections::HashMap<String, Option<String>> = tables
        .iter()
        .map(|t| (t.name.clone(), t.primary_key().first().map(|c| c.name.clone())))
        .collect();

    for table in tables.iter_mut() {
        table.foreign_keys.retain_mut(|fk| match pk_by_table.get(&fk.to_table) {
            None => {
                log::warn!(
                    "Dropping foreign key {}.{} -> {}: target table not readable",
                    fk.from_table,
                    fk.from_column,
                    fk.to_table
                );
                false
            }
            Some(pk) if fk.to_column.is_empty() => match pk {
                Some(pk) => {
                    fk.to_column = pk.clone();
                    true
                }
                None => {
                    log::warn!(
                        "Dropping foreign key {}.{} -> {}: no target column and no primary key",
                        fk.from_table,
                        fk.from_column,
                        fk.to_table
                    );
                    false
                }
            },
            Some(_) => true,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rusqlite::Connection;
    use std::path::{Path, PathBuf};

    /// Customers, products and orders with two declared foreign keys.
    pub const SHOP_SQL: &str = "
        CREATE TABLE customers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT,
            city TEXT
        );
        CREATE TABLE products (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            price REAL,
            photo BLOB
        );
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            product_id INTEGER NOT NULL REFERENCES products,
            quantity INTEGER,
            created_at TEXT
        );
        INSERT INTO customers VALUES (1, 'Ada Lovelace', 'ada@example.com', 'London');
        INSERT INTO customers VALUES (2, 'Grace Hopper', 'grace@example.com', 'New York');
        INSERT INTO customers VALUES (3, 'Alan Turing', 'alan@example.com', 'Manchester');
        INSERT INTO products VALUES (1, 'Wireless Headphones', 'Bluetooth over-ear wireless audio headphones', 199.0, NULL);
        INSERT INTO products VALUES (2, 'Wireless Earbuds', 'Compact wireless audio earbuds with charging case', 129.0, NULL);
        INSERT INTO products VALUES (3, 'Desk Lamp', 'LED desk lamp with adjustable arm', 39.0, NULL);
        INSERT INTO products VALUES (4, 'Coffee Grinder', 'Burr coffee grinder for espresso', 89.0, NULL);
        INSERT INTO orders VALUES (1, 1, 1, 1, '2024-01-01');
        INSERT INTO orders VALUES (2, 2, 2, 2, '2024-01-02');
        INSERT INTO orders VALUES (3, 3, 3, 1, '2024-01-03');
        INSERT INTO orders VALUES (4, 1, 4, 1, '2024-01-04');
        INSERT INTO orders VALUES (5, 2, 1, 1, '2024-01-05');
    ";

    /// Same tables, no rows.
    pub const EMPTY_SHOP_SQL: &str = "
        CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
        CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT);
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER REFERENCES customers(id),
            product_id INTEGER REFERENCES products(id)
        );
    ";

    pub fn create_db(dir: &Path, file: &str, sql: &str) -> PathBuf {
        let path = dir.join(file);
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(sql).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_affinity_rules() {
        assert_eq!(Affinity::from_declared("INTEGER"), Affinity::Integer);
        assert_eq!(Affinity::from_declared("varchar(20)"), Affinity::Text);
        assert_eq!(Affinity::from_declared("BLOB"), Affinity::Blob);
        assert_eq!(Affinity::from_declared("DOUBLE"), Affinity::Real);
        assert_eq!(Affinity::from_declared("DECIMAL(10,2)"), Affinity::Numeric);
        assert!(Affinity::Integer.compatible_with(Affinity::Numeric));
        assert!(!Affinity::Integer.compatible_with(Affinity::Text));
    }

    #[test]
    fn test_extract_shop_schema() {
        let dir = TempDir::new().unwrap();
        let path = create_db(dir.path(), "shop.db", SHOP_SQL);
        let source = SqliteSource::open(path.to_str().unwrap()).unwrap();

        let schema = extract_schema(&source, &InferenceConfig::default()).unwrap();

        assert_eq!(schema.tables.len(), 3);
        assert!(schema.unreadable.is_empty());
        assert_eq!(schema.table("orders").unwrap().row_count, 5);
        assert_eq!(schema.total_rows(), 12);
        assert_eq!(schema.foreign_keys.len(), 2);

        // `REFERENCES products` without a column resolves to the primary key
        let product_fk = schema
            .foreign_keys
            .iter()
            .find(|fk| fk.from_column == "product_id")
            .unwrap();
        assert_eq!(product_fk.to_table, "products");
        assert_eq!(product_fk.to_column, "id");

        // Declared keys are not rediscovered as inferred links
        assert!(schema.inferred_links.is_empty());

        let customers = schema.table("customers").unwrap();
        assert_eq!(customers.sample_rows.len(), 2);
        assert_eq!(customers.primary_key()[0].name, "id");
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let err = SqliteSource::open("sqlite:///definitely/not/here.db").unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }
}
