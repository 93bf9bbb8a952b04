use serde_json::Value;

use crate::error::{KgragError, Result};
use crate::graph::value_text;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(String),
    NotEq(String),
    Gt(f64),
    Lt(f64),
    Ge(f64),
    Le(f64),
    /// Case-insensitive substring
    Contains(String),
}

/// One `property -> value` condition of `filter_nodes`.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyFilter {
    pub property: String,
    pub op: FilterOp,
}

fn number(property: &str, operand: &str) -> Result<f64> {
    operand.trim().parse::<f64>().map_err(|_| {
        KgragError::QueryInvalid(format!(
            "Filter on '{}' compares against '{}', which is not a number",
            property, operand
        ))
    })
}

impl PropertyFilter {
    /// Parse a filter value. Strings may carry an operator prefix:
    /// `>=n`, `<=n`, `!=v`, `>n`, `<n` or `~substr`. Anything else is equality.
    pub fn parse(property: &str, value: &Value) -> Result<Self> {
        let op = match value {
            Value::String(s) => {
                let s = s.trim();
                if let Some(rest) = s.strip_prefix(">=") {
                    FilterOp::Ge(number(property, rest)?)
                } else if let Some(rest) = s.strip_prefix("<=") {
                    FilterOp::Le(number(property, rest)?)
                } else if let Some(rest) = s.strip_prefix("!=") {
                    FilterOp::NotEq(rest.trim().to_string())
                } else if let Some(rest) = s.strip_prefix('>') {
                    FilterOp::Gt(number(property, rest)?)
                } else if let Some(rest) = s.strip_prefix('<') {
                    FilterOp::Lt(number(property, rest)?)
                } else if let Some(rest) = s.strip_prefix('~') {
                    if rest.trim().is_empty() {
                        return Err(KgragError::QueryInvalid(format!(
                            "Filter on '{}' has an empty substring",
                            property
                        )));
                    }
                    FilterOp::Contains(rest.trim().to_lowercase())
                } else {
                    FilterOp::Eq(s.to_string())
                }
            }
            Value::Null => {
                return Err(KgragError::QueryInvalid(format!("Filter on '{}' has no value", property)));
            }
            other => FilterOp::Eq(value_text(other).unwrap_or_default()),
        };
        Ok(Self {
            property: property.to_string(),
            op,
        })
    }

    /// Null and missing properties never match.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return false;
        };
        let text = value_text(value).unwrap_or_default();
        let numeric = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        match &self.op {
            FilterOp::Eq(expected) => text == *expected,
            FilterOp::NotEq(expected) => text != *expected,
            FilterOp::Contains(needle) => text.to_lowercase().contains(needle.as_str()),
            FilterOp::Gt(n) => numeric.is_some_and(|v| v > *n),
            FilterOp::Lt(n) => numeric.is_some_and(|v| v < *n),
            FilterOp::Ge(n) => numeric.is_some_and(|v| v >= *n),
            FilterOp::Le(n) => numeric.is_some_and(|v| v <= *n),
        }
    }
}
