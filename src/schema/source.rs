use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{Column, ForeignKey};
use crate::error::{KgragError, Result};

/// One row read from a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// Engine row id; only meaningful for tables without a primary key.
    pub rowid: Option<i64>,
    pub values: Map<String, Value>,
}

/// Read-only view of a relational database.
pub trait RelationalSource: Send + Sync {
    /// User tables, excluding engine-internal ones, sorted by name.
    fn list_tables(&self) -> Result<Vec<String>>;

    fn columns(&self, table: &str) -> Result<Vec<Column>>;

    /// Declared foreign keys. `to_column` is empty when the declaration omits it.
    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>>;

    fn row_count(&self, table: &str) -> Result<u64>;

    fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<Map<String, Value>>>;

    /// Up to `limit` distinct non-null values, rendered as text.
    fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<HashSet<String>>;

    /// A page of rows in a stable order (primary key, else rowid).
    fn read_rows(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<SourceRow>>;
}

/// SQLite database opened read-only.
pub struct SqliteSource {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSource").field("path", &self.path).finish()
    }
}

/// Strip the `sqlite://` / `sqlite:` scheme, if any.
pub fn parse_connection_string(connection: &str) -> Result<PathBuf> {
    let trimmed = connection.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);

    if path.is_empty() {
        return Err(KgragError::SourceUnavailable("empty connection string".to_string()));
    }
    if path.contains("://") {
        return Err(KgragError::SourceUnavailable(format!(
            "unsupported connection scheme: {}",
            connection
        )));
    }
    Ok(PathBuf::from(path))
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

impl SqliteSource {
    pub fn open(connection: &str) -> Result<Self> {
        let path = parse_connection_string(connection)?;
        if !path.exists() {
            return Err(KgragError::SourceUnavailable(format!(
                "database file not found: {}",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| KgragError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;

        // Touch the catalog so corrupt or non-database files fail here.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| KgragError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| KgragError::SourceUnavailable("source connection poisoned".to_string()))?;
        f(&conn)
    }

    fn order_clause(&self, conn: &Connection, table: &str) -> Result<(String, bool)> {
        let mut pk: Vec<(i64, String)> = Vec::new();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (ordinal, name) = row?;
            if ordinal > 0 {
                pk.push((ordinal, name));
            }
        }
        if pk.is_empty() {
            return Ok(("rowid".to_string(), true));
        }
        pk.sort();
        let cols: Vec<String> = pk.iter().map(|(_, name)| quote_ident(name)).collect();
        Ok((cols.join(", "), false))
    }
}

impl RelationalSource for SqliteSource {
    fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(|e| KgragError::SourceUnavailable(e.to_string()))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
                .map_err(|e| KgragError::SourceUnavailable(e.to_string()))?;
            Ok(names)
        })
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
            let columns = stmt
                .query_map([], |row| {
                    Ok(Column {
                        name: row.get(1)?,
                        declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        not_null: row.get::<_, i64>(3)? != 0,
                        pk_ordinal: row.get::<_, i64>(5)?.max(0) as usize,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(columns)
        })
    }

    fn foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
            let fks = stmt
                .query_map([], |row| {
                    Ok(ForeignKey {
                        from_table: table.to_string(),
                        from_column: row.get(3)?,
                        to_table: row.get(2)?,
                        to_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(fks)
        })
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT count(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }

    fn sample_rows(&self, table: &str, limit: usize) -> Result<Vec<Map<String, Value>>> {
        Ok(self
            .read_rows(table, 0, limit)?
            .into_iter()
            .map(|row| row.values)
            .collect())
    }

    fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let col = quote_ident(column);
            let sql = format!(
                "SELECT DISTINCT CAST({col} AS TEXT) FROM {} WHERE {col} IS NOT NULL LIMIT ?1",
                quote_ident(table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let values = stmt
                .query_map([limit as i64], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<HashSet<_>, _>>()?;
            Ok(values)
        })
    }

    fn read_rows(&self, table: &str, offset: usize, limit: usize) -> Result<Vec<SourceRow>> {
        self.with_conn(|conn| {
            let (order, by_rowid) = self.order_clause(conn, table)?;
            let sql = if by_rowid {
                format!(
                    "SELECT rowid AS __kgrag_rowid, * FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
                    quote_ident(table),
                    order
                )
            } else {
                format!("SELECT * FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2", quote_ident(table), order)
            };

            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query([limit as i64, offset as i64])?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Map::new();
                let mut rowid = None;
                for (idx, name) in names.iter().enumerate() {
                    let value = row.get_ref(idx)?;
                    if by_rowid && idx == 0 {
                        if let ValueRef::Integer(id) = value {
                            rowid = Some(id);
                        }
                        continue;
                    }
                    values.insert(name.clone(), value_to_json(value));
                }
                out.push(SourceRow { rowid, values });
            }
            Ok(out)
        })
    }
}
