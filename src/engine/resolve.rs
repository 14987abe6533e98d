//! Post-traversal resolution of deferred stubs and tree serialization.
//!
//! Traversal records every stub's `(component, id)` in the context's pending
//! buffer; this pass issues exactly one batched lookup per component name,
//! substitutes the full rows in place, and renders the tree to JSON. A stub
//! whose id no longer matches a row (deleted concurrently) is logged and left
//! carrying an `unresolved` marker; it never fails the call.

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::db::Row;
use crate::error::Result;
use crate::query;

use super::traverse::{Children, Ctx, Node};

/// Replace every deferred stub in the tree with its full row, fetched in one
/// batch per component name.
pub(crate) fn resolve(ctx: &mut Ctx, tree: &mut Children) -> Result<()> {
    let pending = std::mem::take(&mut ctx.pending);
    let mut lookup: HashMap<(String, i64), Row> = HashMap::new();

    for (comp, ids) in &pending {
        let Some(def) = ctx.registry.get(comp) else {
            continue;
        };
        let ids: Vec<i64> = ids.iter().copied().collect();
        let compiled = query::compile_select_by_ids(ctx.prefix, &def.instance(), &ids)?;
        let rows = ctx.cached(&compiled)?;
        for row in rows.iter() {
            if let Some(id) = row.get("id").and_then(Json::as_i64) {
                lookup.insert((comp.clone(), id), row.clone());
            }
        }
    }

    for nodes in tree.values_mut() {
        for node in nodes {
            substitute(node, &lookup);
        }
    }
    Ok(())
}

fn substitute(node: &mut Node, lookup: &HashMap<(String, i64), Row>) {
    if let Node::Deferred {
        comp,
        id,
        rel_type,
        children,
    } = node
    {
        match lookup.get(&(comp.clone(), *id)) {
            Some(row) => {
                *node = Node::Resolved {
                    row: row.clone(),
                    rel_type: rel_type.take(),
                    aggregate: false,
                    children: std::mem::take(children),
                };
            }
            None => {
                log::warn!("dangling reference: {}({}) has no matching row", comp, id);
            }
        }
    }
    for nodes in node.children_mut().values_mut() {
        for child in nodes {
            substitute(child, lookup);
        }
    }
}

/// Render the final tree: a mapping from component name to an ordered list of
/// nodes, each `{"self": {...}}` (or `{"aggregate": {...}}`) plus child
/// entries keyed by related component names.
pub(crate) fn tree_to_json(tree: &Children) -> Json {
    let mut obj = serde_json::Map::new();
    for (name, nodes) in tree {
        obj.insert(
            name.clone(),
            Json::Array(nodes.iter().map(node_to_json).collect()),
        );
    }
    Json::Object(obj)
}

fn node_to_json(node: &Node) -> Json {
    let mut obj = serde_json::Map::new();
    match node {
        Node::Resolved {
            row,
            rel_type,
            aggregate,
            ..
        } => {
            let mut body = row.clone();
            if let Some(rel_type) = rel_type {
                body.insert("relType".to_string(), Json::from(rel_type.as_str()));
            }
            let tag = if *aggregate { "aggregate" } else { "self" };
            obj.insert(tag.to_string(), Json::Object(body));
        }
        Node::Deferred {
            comp, id, rel_type, ..
        } => {
            obj.insert("id".to_string(), Json::from(*id));
            if let Some(rel_type) = rel_type {
                obj.insert("relType".to_string(), Json::from(rel_type.as_str()));
            }
            obj.insert("unresolved".to_string(), Json::from(comp.as_str()));
        }
    }
    for (name, children) in node.children() {
        obj.insert(
            name.clone(),
            Json::Array(children.iter().map(node_to_json).collect()),
        );
    }
    Json::Object(obj)
}
