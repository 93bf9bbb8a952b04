use serde_json::{json, Map, Value};
use std::time::Instant;

use super::{PropertyFilter, ToolCall, ToolContext};
use crate::error::{KgragError, Result};
use crate::graph::{cypher, parse_node_id, value_text, GraphNode, GraphRelationship};

/// Run one validated call against the context's snapshot.
pub async fn dispatch(ctx: &ToolContext, call: &ToolCall) -> Result<Value> {
    let start = Instant::now();
    let result = match call {
        ToolCall::VectorSearch { query, k } => {
            handle_vector_search(ctx, query, k.unwrap_or(ctx.config.default_top_k)).await
        }
        ToolCall::CypherQuery { query } => handle_cypher_query(ctx, query).await,
        ToolCall::GetNodeDetails { label, key, node_id } => {
            handle_get_node_details(ctx, label.as_deref(), key.as_ref(), node_id.as_deref()).await
        }
        ToolCall::FilterNodes { label, filters, limit } => {
            handle_filter_nodes(ctx, label, filters, limit.unwrap_or(ctx.config.filter_limit)).await
        }
        ToolCall::GraphStats {} => handle_graph_stats(ctx).await,
    };
    log::debug!("Tool {} finished in {:?} (ok: {})", call.name(), start.elapsed(), result.is_ok());
    result
}

async fn handle_vector_search(ctx: &ToolContext, query: &str, k: usize) -> Result<Value> {
    if ctx.index.is_empty() {
        return Ok(json!([]));
    }
    let vector = ctx.embedder.embed_query(query).await?;
    let hits = ctx.index.search(&vector, k.min(ctx.config.max_top_k))?;
    Ok(serde_json::to_value(hits)?)
}

async fn handle_cypher_query(ctx: &ToolContext, query: &str) -> Result<Value> {
    let text = query.to_string();
    let cap = ctx.config.cypher_row_limit;
    let result = ctx
        .store
        .read(ctx.generation, move |reader| cypher::run(reader, &text, cap))
        .await?;
    Ok(serde_json::to_value(result)?)
}

fn node_json(node: &GraphNode) -> Value {
    json!({
        "node_id": node.id(),
        "label": node.label,
        "key": node.key,
        "properties": node.properties,
    })
}

fn relationship_json(rel: &GraphRelationship, outgoing: bool) -> Value {
    if outgoing {
        json!({"type": rel.rel_type, "target": rel.dst_id()})
    } else {
        json!({"type": rel.rel_type, "source": rel.src_id()})
    }
}

async fn handle_get_node_details(
    ctx: &ToolContext,
    label: Option<&str>,
    key: Option<&Value>,
    node_id: Option<&str>,
) -> Result<Value> {
    let (label, key) = match (node_id.and_then(parse_node_id), label, key.and_then(value_text)) {
        (Some((label, key)), _, _) => (label.to_string(), key.to_string()),
        (None, Some(label), Some(key)) => (label.to_string(), key),
        _ => {
            return Err(KgragError::QueryInvalid(
                "get_node_details needs 'label' and 'key', or 'node_id'".into(),
            ))
        }
    };

    ctx.store
        .read(ctx.generation, move |reader| {
            let Some(node) = reader.node(&label, &key)? else {
                return Ok(json!({"node": null, "outgoing": [], "incoming": []}));
            };
            let outgoing: Vec<Value> = reader
                .outgoing(&label, &key)?
                .iter()
                .map(|r| relationship_json(r, true))
                .collect();
            let incoming: Vec<Value> = reader
                .incoming(&label, &key)?
                .iter()
                .map(|r| relationship_json(r, false))
                .collect();
            Ok(json!({"node": node_json(&node), "outgoing": outgoing, "incoming": incoming}))
        })
        .await
}

async fn handle_filter_nodes(
    ctx: &ToolContext,
    label: &str,
    filters: &Map<String, Value>,
    limit: usize,
) -> Result<Value> {
    let node_def = ctx.ontology.node_for_label(label).ok_or_else(|| {
        KgragError::QueryInvalid(format!(
            "Unknown label '{}'. Known labels: {}",
            label,
            ctx.ontology.labels().join(", ")
        ))
    })?;

    let mut parsed = Vec::with_capacity(filters.len());
    for (property, value) in filters {
        if !node_def.attributes.iter().any(|a| &a.property == property) {
            return Err(KgragError::QueryInvalid(format!(
                "Label '{}' has no property '{}'",
                label, property
            )));
        }
        parsed.push(PropertyFilter::parse(property, value)?);
    }

    let label = label.to_string();
    let limit = limit.max(1);
    ctx.store
        .read(ctx.generation, move |reader| {
            let matching: Vec<GraphNode> = reader
                .nodes_by_label(&label)?
                .into_iter()
                .filter(|node| parsed.iter().all(|f| f.matches(node.properties.get(&f.property))))
                .collect();
            let total = matching.len();
            let nodes: Vec<Value> = matching.iter().take(limit).map(node_json).collect();
            Ok(json!({
                "label": label,
                "total_matches": total,
                "truncated": total > limit,
                "nodes": nodes,
            }))
        })
        .await
}

async fn handle_graph_stats(ctx: &ToolContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.store.stats(ctx.generation).await?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, BuildConfig, InferenceConfig};
    use crate::embeddings::{Embedder, HashingEmbedder};
    use crate::graph::{build_graph, GraphStore};
    use crate::index::{build_index, VectorIndex};
    use crate::ontology::generate_default;
    use crate::schema::test_support::{create_db, SHOP_SQL};
    use crate::schema::{extract_schema, RelationalSource, SqliteSource};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn shop_context(dir: &TempDir) -> ToolContext {
        let path = create_db(dir.path(), "shop.db", SHOP_SQL);
        let source: Arc<dyn RelationalSource> = Arc::new(SqliteSource::open(path.to_str().unwrap()).unwrap());
        let schema = extract_schema(source.as_ref(), &InferenceConfig::default()).unwrap();
        let ontology = generate_default(&schema, 0.75);
        let store = GraphStore::open(dir.path().join("graph.db")).await.unwrap();
        let generation = store.begin_generation("shop", &ontology).await.unwrap();
        build_graph(source, &ontology, &store, generation, &BuildConfig::default())
            .await
            .unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let index = build_index(&store, generation, &ontology, embedder.as_ref(), 10)
            .await
            .unwrap();
        ToolContext {
            store,
            generation,
            index: Arc::new(index),
            ontology: Arc::new(ontology),
            embedder,
            config: AgentConfig::default(),
        }
    }

    async fn call(ctx: &ToolContext, tool: &str, args: Value) -> Result<Value> {
        let call = ToolCall::from_parts(tool, Some(args))?.validate(&ctx.config)?;
        dispatch(ctx, &call).await
    }

    #[tokio::test]
    async fn test_vector_search_descending() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        let hits = call(&ctx, "vector_search", json!({"query": "wireless audio", "k": 3}))
            .await
            .unwrap();
        let hits = hits.as_array().unwrap();
        assert_eq!(hits.len(), 3);
        let top: Vec<&str> = hits[..2].iter().map(|h| h["node_id"].as_str().unwrap()).collect();
        assert!(top.contains(&"Product:1"));
        assert!(top.contains(&"Product:2"));
        let scores: Vec<f64> = hits.iter().map(|h| h["score"].as_f64().unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }

    #[tokio::test]
    async fn test_vector_search_on_empty_index() {
        let dir = TempDir::new().unwrap();
        let mut ctx = shop_context(&dir).await;
        ctx.index = Arc::new(VectorIndex::new(ctx.generation, 256));
        let hits = call(&ctx, "vector_search", json!({"query": "anything"})).await.unwrap();
        assert_eq!(hits, json!([]));
    }

    #[tokio::test]
    async fn test_cypher_query_and_invalid_query() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        let result = call(&ctx, "cypher_query", json!({"query": "MATCH (p:Product) RETURN count(p)"}))
            .await
            .unwrap();
        assert_eq!(result["rows"], json!([[4]]));

        let err = call(&ctx, "cypher_query", json!({"query": "CREATE (x:Product)"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "query_invalid");
    }

    #[tokio::test]
    async fn test_node_details_both_directions() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        let customer = call(&ctx, "get_node_details", json!({"label": "Customer", "key": 1}))
            .await
            .unwrap();
        assert_eq!(customer["node"]["properties"]["name"], "Ada Lovelace");
        assert_eq!(customer["outgoing"], json!([]));
        assert_eq!(customer["incoming"].as_array().unwrap().len(), 2);

        let order = call(&ctx, "get_node_details", json!({"node_id": "Order:4"})).await.unwrap();
        let targets: Vec<&str> = order["outgoing"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["target"].as_str().unwrap())
            .collect();
        assert!(targets.contains(&"Customer:1"));
        assert!(targets.contains(&"Product:4"));

        let missing = call(&ctx, "get_node_details", json!({"node_id": "Customer:99"}))
            .await
            .unwrap();
        assert_eq!(missing["node"], Value::Null);
    }

    #[tokio::test]
    async fn test_filter_nodes() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        let result = call(
            &ctx,
            "filter_nodes",
            json!({"label": "Product", "filters": {"price": ">100", "name": "~wireless"}}),
        )
        .await
        .unwrap();
        assert_eq!(result["total_matches"], 2);

        let result = call(&ctx, "filter_nodes", json!({"label": "Order", "limit": 2})).await.unwrap();
        assert_eq!(result["total_matches"], 5);
        assert_eq!(result["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn test_filter_nodes_rejects_unknown_label_property_and_operator() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;

        for args in [
            json!({"label": "Supplier"}),
            json!({"label": "Product", "filters": {"colour": "red"}}),
            json!({"label": "Product", "filters": {"price": ">cheap"}}),
        ] {
            let err = call(&ctx, "filter_nodes", args.clone()).await.unwrap_err();
            assert_eq!(err.kind(), "query_invalid", "{}", args);
        }
    }

    #[tokio::test]
    async fn test_graph_stats() {
        let dir = TempDir::new().unwrap();
        let ctx = shop_context(&dir).await;
        let stats = call(&ctx, "graph_stats", json!({})).await.unwrap();
        assert_eq!(stats["nodes_by_label"]["Customer"], 3);
        assert_eq!(stats["total_nodes"], 12);
        assert_eq!(stats["relationships_by_type"]["HAS_CUSTOMER"], 5);
    }
}
