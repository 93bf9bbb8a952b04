//! Read-only Cypher subset.
//!
//! Supports one `MATCH` path pattern, AND-joined `WHERE` comparisons,
//! `RETURN` with `count`, `labels`, `type`, `DISTINCT` and aliases, plus
//! `ORDER BY` and `LIMIT`. Anything that could write is rejected before
//! evaluation.

pub mod executor;
pub mod parser;

pub use executor::{execute, CypherResult};
pub use parser::{parse, Query};

use super::GraphReader;
use crate::error::Result;

/// Parse and run `text`, capping the result at `row_cap` rows.
pub fn run(reader: &GraphReader<'_>, text: &str, row_cap: usize) -> Result<CypherResult> {
    let query = parse(text)?;
    log::debug!("Executing traversal: {}", text);
    execute(reader, &query, row_cap)
}
