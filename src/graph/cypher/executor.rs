//! Evaluates a parsed query against one graph generation.

use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::parser::{CompareOp, Direction, Expr, Literal, NodePattern, Query};
use crate::error::{KgragError, Result};
use crate::graph::{value_text, GraphNode, GraphReader, GraphRelationship};

/// Upper bound on partial path matches kept while expanding a pattern.
const MAX_BINDINGS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CypherResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// More rows matched than the row cap allowed.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
enum Bound {
    Node(Arc<GraphNode>),
    Rel(Arc<GraphRelationship>),
}

type Binding = HashMap<String, Bound>;

fn invalid(msg: impl Into<String>) -> KgragError {
    KgragError::QueryInvalid(msg.into())
}

fn node_json(node: &GraphNode) -> Value {
    json!({
        "id": node.id(),
        "label": node.label,
        "key": node.key,
        "properties": node.properties,
    })
}

fn rel_json(rel: &GraphRelationship) -> Value {
    json!({
        "type": rel.rel_type,
        "from": rel.src_id(),
        "to": rel.dst_id(),
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Comparison with Cypher's null semantics: anything involving null is false.
pub fn compare(value: &Value, op: CompareOp, literal: &Literal) -> bool {
    if value.is_null() || *literal == Literal::Null {
        return false;
    }

    if matches!(op, CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith) {
        let (Some(text), Literal::Str(needle)) = (value_text(value), literal) else {
            return false;
        };
        return match op {
            CompareOp::Contains => text.contains(needle.as_str()),
            CompareOp::StartsWith => text.starts_with(needle.as_str()),
            _ => text.ends_with(needle.as_str()),
        };
    }

    let ordering = match (literal, value) {
        (Literal::Int(_) | Literal::Float(_), _) => {
            let rhs = match literal {
                Literal::Int(i) => *i as f64,
                Literal::Float(f) => *f,
                _ => return false,
            };
            as_number(value).and_then(|lhs| lhs.partial_cmp(&rhs))
        }
        (Literal::Str(s), Value::String(v)) => Some(v.as_str().cmp(s.as_str())),
        (Literal::Str(s), Value::Number(_)) => value_text(value).map(|v| v.cmp(s)),
        (Literal::Bool(b), Value::Bool(v)) => Some(v.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Ne, None) => true,
        (_, None) => false,
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        Value::Array(_) | Value::Object(_) => 3,
        Value::Null => 4,
    }
}

/// Total order used by ORDER BY; nulls sort last.
pub fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match type_rank(a).cmp(&type_rank(b)) {
            Ordering::Equal => a.to_string().cmp(&b.to_string()),
            other => other,
        },
    }
}

fn props_match(node: &GraphNode, props: &[(String, Literal)]) -> bool {
    props.iter().all(|(key, literal)| {
        node.properties
            .get(key)
            .map(|v| compare(v, CompareOp::Eq, literal))
            .unwrap_or(false)
    })
}

fn node_var(pattern: &NodePattern, index: usize) -> String {
    pattern.var.clone().unwrap_or_else(|| format!(" n{}", index))
}

struct Matcher<'r, 'c> {
    reader: &'r GraphReader<'c>,
    cache: HashMap<(String, String), Option<Arc<GraphNode>>>,
}

impl<'r, 'c> Matcher<'r, 'c> {
    fn node(&mut self, label: &str, key: &str) -> Result<Option<Arc<GraphNode>>> {
        let cache_key = (label.to_string(), key.to_string());
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit.clone());
        }
        let node = self.reader.node(label, key)?.map(Arc::new);
        self.cache.insert(cache_key, node.clone());
        Ok(node)
    }

    fn start(&mut self, pattern: &NodePattern, var: &str) -> Result<Vec<Binding>> {
        let nodes = match &pattern.label {
            Some(label) => self.reader.nodes_by_label(label)?,
            None => self.reader.all_nodes()?,
        };
        let mut bindings = Vec::new();
        for node in nodes.into_iter().filter(|n| props_match(n, &pattern.props)) {
            let node = Arc::new(node);
            self.cache.insert((node.label.clone(), node.key.clone()), Some(Arc::clone(&node)));
            let mut binding = Binding::new();
            binding.insert(var.to_string(), Bound::Node(node));
            bindings.push(binding);
        }
        Ok(bindings)
    }
}

fn check_bindings(count: usize) -> Result<()> {
    if count > MAX_BINDINGS {
        return Err(invalid(format!(
            "pattern matches more than {} paths; add labels or property filters",
            MAX_BINDINGS
        )));
    }
    Ok(())
}

fn match_pattern(reader: &GraphReader<'_>, query: &Query) -> Result<Vec<Binding>> {
    let pattern = &query.pattern;
    let mut matcher = Matcher {
        reader,
        cache: HashMap::new(),
    };

    let first_var = node_var(&pattern.nodes[0], 0);
    let mut bindings = matcher.start(&pattern.nodes[0], &first_var)?;
    check_bindings(bindings.len())?;

    for (idx, rel_pattern) in pattern.rels.iter().enumerate() {
        let from_var = node_var(&pattern.nodes[idx], idx);
        let next = &pattern.nodes[idx + 1];
        let next_var = node_var(next, idx + 1);
        let rel_var = rel_pattern.var.clone().unwrap_or_else(|| format!(" r{}", idx));

        let mut expanded = Vec::new();
        for binding in &bindings {
            let Some(Bound::Node(current)) = binding.get(&from_var) else {
                return Err(invalid(format!("{} is not a node", from_var)));
            };

            let mut candidates: Vec<(GraphRelationship, bool)> = Vec::new();
            if matches!(rel_pattern.direction, Direction::Out | Direction::Either) {
                for rel in reader.outgoing(&current.label, &current.key)? {
                    candidates.push((rel, true));
                }
            }
            if matches!(rel_pattern.direction, Direction::In | Direction::Either) {
                for rel in reader.incoming(&current.label, &current.key)? {
                    candidates.push((rel, false));
                }
            }

            for (rel, outgoing) in candidates {
                if !rel_pattern.types.is_empty() && !rel_pattern.types.contains(&rel.rel_type) {
                    continue;
                }
                let (label, key) = if outgoing {
                    (&rel.dst_label, &rel.dst_key)
                } else {
                    (&rel.src_label, &rel.src_key)
                };
                if next.label.as_deref().is_some_and(|l| l != label.as_str()) {
                    continue;
                }
                // A relationship appears at most once per path
                let reused = binding
                    .values()
                    .any(|b| matches!(b, Bound::Rel(existing) if **existing == rel));
                if reused {
                    continue;
                }

                let Some(node) = matcher.node(label, key)? else {
                    continue;
                };
                if !props_match(&node, &next.props) {
                    continue;
                }
                match binding.get(&next_var) {
                    Some(Bound::Node(existing)) if existing.id() != node.id() => continue,
                    Some(Bound::Rel(_)) => return Err(invalid(format!("{} is not a node", next_var))),
                    _ => {}
                }
                if binding.contains_key(&rel_var) {
                    return Err(invalid(format!("variable {} is bound twice", rel_var)));
                }

                let mut extended = binding.clone();
                extended.insert(rel_var.clone(), Bound::Rel(Arc::new(rel.clone())));
                extended.insert(next_var.clone(), Bound::Node(node));
                expanded.push(extended);
            }
            check_bindings(expanded.len())?;
        }
        bindings = expanded;
    }

    Ok(bindings)
}

fn eval(expr: &Expr, binding: &Binding) -> Result<Value> {
    let lookup = |var: &str| binding.get(var).ok_or_else(|| invalid(format!("unknown variable {}", var)));
    Ok(match expr {
        Expr::Var(v) => match lookup(v)? {
            Bound::Node(n) => node_json(n),
            Bound::Rel(r) => rel_json(r),
        },
        Expr::Prop(v, p) => match lookup(v)? {
            Bound::Node(n) => n.properties.get(p).cloned().unwrap_or(Value::Null),
            Bound::Rel(_) => Value::Null,
        },
        Expr::Labels(v) => match lookup(v)? {
            Bound::Node(n) => json!([n.label]),
            Bound::Rel(_) => return Err(invalid(format!("labels() expects a node, {} is a relationship", v))),
        },
        Expr::Type(v) => match lookup(v)? {
            Bound::Rel(r) => Value::String(r.rel_type.clone()),
            Bound::Node(_) => return Err(invalid(format!("type() expects a relationship, {} is a node", v))),
        },
        Expr::CountStar | Expr::Count(_) => return Err(invalid("aggregate used outside RETURN")),
    })
}

fn declared_vars(query: &Query) -> HashSet<String> {
    let mut vars = HashSet::new();
    for node in &query.pattern.nodes {
        if let Some(v) = &node.var {
            vars.insert(v.clone());
        }
    }
    for rel in &query.pattern.rels {
        if let Some(v) = &rel.var {
            vars.insert(v.clone());
        }
    }
    vars
}

fn expr_var(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Var(v) | Expr::Prop(v, _) | Expr::Count(v) | Expr::Labels(v) | Expr::Type(v) => Some(v),
        Expr::CountStar => None,
    }
}

fn validate(query: &Query) -> Result<()> {
    let vars = declared_vars(query);
    let aliases: HashSet<String> = query.returns.iter().filter_map(|r| r.alias.clone()).collect();

    for condition in &query.conditions {
        if !vars.contains(&condition.var) {
            return Err(invalid(format!("unknown variable {} in WHERE", condition.var)));
        }
    }
    for item in &query.returns {
        if let Some(v) = expr_var(&item.expr) {
            if !vars.contains(v) {
                return Err(invalid(format!("unknown variable {} in RETURN", v)));
            }
        }
    }
    for item in &query.order_by {
        if let Some(v) = expr_var(&item.expr) {
            let is_alias = matches!(&item.expr, Expr::Var(name) if aliases.contains(name));
            if !is_alias && !vars.contains(v) {
                return Err(invalid(format!("unknown variable {} in ORDER BY", v)));
            }
        }
    }
    Ok(())
}

/// Index of the RETURN column an ORDER BY item refers to, by alias or by
/// identical expression.
fn order_column(query: &Query, expr: &Expr) -> Option<usize> {
    query.returns.iter().position(|r| match (&r.alias, expr) {
        (Some(alias), Expr::Var(name)) if alias == name => true,
        _ => r.expr == *expr,
    })
}

fn sort_rows(rows: &mut [(Vec<Value>, Vec<Value>)], descending: &[bool]) {
    rows.sort_by(|(a, _), (b, _)| {
        for (idx, desc) in descending.iter().enumerate() {
            let ord = order_values(&a[idx], &b[idx]);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Run `query`, returning at most `row_cap` rows.
pub fn execute(reader: &GraphReader<'_>, query: &Query, row_cap: usize) -> Result<CypherResult> {
    validate(query)?;

    let mut bindings = match_pattern(reader, query)?;
    bindings.retain(|binding| {
        query.conditions.iter().all(|c| match binding.get(&c.var) {
            Some(Bound::Node(n)) => n.properties.get(&c.prop).map(|v| compare(v, c.op, &c.value)).unwrap_or(false),
            _ => false,
        })
    });

    let columns: Vec<String> = query.returns.iter().map(|r| r.column_name()).collect();
    let aggregating = query.returns.iter().any(|r| r.expr.is_aggregate());
    let descending: Vec<bool> = query.order_by.iter().map(|o| o.descending).collect();

    // (sort keys, projected row)
    let mut rows: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();

    if aggregating {
        let mut groups: Vec<Vec<Value>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for binding in &bindings {
            let mut key_values = Vec::with_capacity(query.returns.len());
            for item in &query.returns {
                key_values.push(if item.expr.is_aggregate() {
                    Value::Null
                } else {
                    eval(&item.expr, binding)?
                });
            }
            let group_key = serde_json::to_string(&key_values)?;
            let slot = *index.entry(group_key).or_insert_with(|| {
                groups.push(
                    query
                        .returns
                        .iter()
                        .zip(key_values.iter())
                        .map(|(item, v)| if item.expr.is_aggregate() { Value::from(0u64) } else { v.clone() })
                        .collect(),
                );
                groups.len() - 1
            });
            for (col, item) in query.returns.iter().enumerate() {
                if item.expr.is_aggregate() {
                    let current = groups[slot][col].as_u64().unwrap_or(0);
                    groups[slot][col] = Value::from(current + 1);
                }
            }
        }

        let only_aggregates = query.returns.iter().all(|r| r.expr.is_aggregate());
        if groups.is_empty() && only_aggregates {
            groups.push(query.returns.iter().map(|_| Value::from(0u64)).collect());
        }

        for row in groups {
            let mut keys = Vec::with_capacity(query.order_by.len());
            for item in &query.order_by {
                let col = order_column(query, &item.expr).ok_or_else(|| {
                    invalid("ORDER BY in an aggregating query must name a returned column")
                })?;
                keys.push(row[col].clone());
            }
            rows.push((keys, row));
        }
    } else {
        for binding in &bindings {
            let mut row = Vec::with_capacity(query.returns.len());
            for item in &query.returns {
                row.push(eval(&item.expr, binding)?);
            }
            let mut keys = Vec::with_capacity(query.order_by.len());
            for item in &query.order_by {
                keys.push(match order_column(query, &item.expr) {
                    Some(col) => row[col].clone(),
                    None => eval(&item.expr, binding)?,
                });
            }
            rows.push((keys, row));
        }
    }

    if !descending.is_empty() {
        sort_rows(&mut rows, &descending);
    }

    let mut projected: Vec<Vec<Value>> = rows.into_iter().map(|(_, row)| row).collect();
    if query.distinct {
        let mut seen = HashSet::new();
        projected.retain(|row| seen.insert(serde_json::to_string(row).unwrap_or_default()));
    }

    let limit = query.limit.unwrap_or(row_cap).min(row_cap);
    let capped = query.limit.map_or(true, |requested| requested > row_cap);
    let truncated = capped && projected.len() > limit;
    projected.truncate(limit);

    Ok(CypherResult {
        columns,
        rows: projected,
        truncated,
    })
}
