//! Recursive upstream/downstream expansion of the relationship graph.
//!
//! Each direction is a mirror image of the same walk: fetch the root rows,
//! then repeatedly fan out over the edges incident to the current row set
//! (one batched `IN` query per level per component, not one per row). Rows
//! reached through an edge are *not* fetched individually; a deferred stub
//! carrying the id is appended and recorded for the resolver's batched
//! lookup. The only termination guarantee on cyclic graphs is the
//! per-direction depth limit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value as Json;

use crate::component::Component;
use crate::component::Instance;
use crate::db::{self, Row};
use crate::error::Result;
use crate::query::{self, CompiledQuery, Filters};
use crate::rel::{self, Direction};

pub(crate) type Children = BTreeMap<String, Vec<Node>>;

/// One entry in a result list: a materialized row, or a stub awaiting the
/// resolver's batched lookup.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Resolved {
        row: Row,
        rel_type: Option<String>,
        /// Row came from an aggregate/group projection; it has no discrete id.
        aggregate: bool,
        children: Children,
    },
    Deferred {
        comp: String,
        id: i64,
        rel_type: Option<String>,
        children: Children,
    },
}

impl Node {
    pub(crate) fn id(&self) -> Option<i64> {
        match self {
            Node::Resolved { row, .. } => row.get("id").and_then(Json::as_i64),
            Node::Deferred { id, .. } => Some(*id),
        }
    }

    pub(crate) fn children(&self) -> &Children {
        match self {
            Node::Resolved { children, .. } | Node::Deferred { children, .. } => children,
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut Children {
        match self {
            Node::Resolved { children, .. } | Node::Deferred { children, .. } => children,
        }
    }
}

/// Call-scoped traversal state. Created fresh for every `get` invocation and
/// discarded afterward; the memo cache must never outlive the call.
pub(crate) struct Ctx<'a> {
    pub conn: &'a Connection,
    pub registry: &'a HashMap<String, Arc<dyn Component>>,
    pub prefix: &'a str,
    memo: HashMap<String, Rc<Vec<Row>>>,
    /// Deferred stub ids awaiting resolution, keyed by component name.
    pub pending: HashMap<String, BTreeSet<i64>>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(
        conn: &'a Connection,
        registry: &'a HashMap<String, Arc<dyn Component>>,
        prefix: &'a str,
    ) -> Self {
        Self {
            conn,
            registry,
            prefix,
            memo: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Run a compiled query, reusing the result of an identical earlier query
    /// from this call.
    pub(crate) fn cached(&mut self, compiled: &CompiledQuery) -> Result<Rc<Vec<Row>>> {
        let key = format!(
            "{}\u{1f}{}",
            compiled.sql,
            Json::Array(compiled.params.clone())
        );
        if let Some(hit) = self.memo.get(&key) {
            log::debug!("memo hit: {}", compiled.sql);
            return Ok(Rc::clone(hit));
        }
        let rows = Rc::new(db::query_rows(self.conn, &compiled.sql, &compiled.params)?);
        self.memo.insert(key, Rc::clone(&rows));
        Ok(rows)
    }
}

/// Expand one direction from the root instance into `out`.
pub(crate) fn expand_root(
    ctx: &mut Ctx,
    inst: &Instance,
    out: &mut Vec<Node>,
    filters: &Filters,
    limit: u32,
    dir: Direction,
) -> Result<()> {
    let compiled = query::compile_select(ctx.prefix, inst, filters)?;
    let rows = ctx.cached(&compiled)?;
    let aggregate = !filters.aggregate.is_empty() || filters.group.is_some();
    let start = out.len();
    for row in rows.iter() {
        out.push(Node::Resolved {
            row: row.clone(),
            rel_type: None,
            aggregate,
            children: Children::new(),
        });
    }
    // Aggregate and grouped rows are projections, not component rows; an
    // `id` column in one must never seed edge fan-out.
    if aggregate {
        return Ok(());
    }
    fan_out(ctx, inst.name(), &mut out[start..], 0, limit, dir)
}

/// Append a deferred stub for a row reached through an edge, then continue
/// fanning out from its id.
fn expand_child(
    ctx: &mut Ctx,
    comp: &str,
    id: i64,
    rel_type: Option<String>,
    out: &mut Vec<Node>,
    depth: u32,
    limit: u32,
    dir: Direction,
) -> Result<()> {
    out.push(Node::Deferred {
        comp: comp.to_string(),
        id,
        rel_type,
        children: Children::new(),
    });
    ctx.pending.entry(comp.to_string()).or_default().insert(id);
    let last = out.len() - 1;
    fan_out(ctx, comp, &mut out[last..], depth, limit, dir)
}

/// Fetch all edges incident to `nodes` in the traversal direction with one
/// batched query, group them by originating row id, and recurse into the
/// opposite endpoints at `depth + 1`, threading each edge's `type` down as
/// the child's `relType`.
fn fan_out(
    ctx: &mut Ctx,
    comp: &str,
    nodes: &mut [Node],
    depth: u32,
    limit: u32,
    dir: Direction,
) -> Result<()> {
    if depth >= limit {
        return Ok(());
    }
    let ids: Vec<i64> = nodes.iter().filter_map(Node::id).collect();
    if ids.is_empty() {
        return Ok(());
    }

    let compiled = rel::edges_query(ctx.prefix, comp, &ids, dir)?;
    let edges = ctx.cached(&compiled)?;

    // (opposite component, opposite id, edge type), grouped by origin row id
    let mut by_origin: HashMap<i64, Vec<(String, i64, Option<String>)>> = HashMap::new();
    for edge in edges.iter() {
        let (origin_key, comp_key, id_key) = match dir {
            Direction::Upstream => ("target_id", "source_comp", "source_id"),
            Direction::Downstream => ("source_id", "target_comp", "target_id"),
        };
        let (Some(origin), Some(other_comp), Some(other_id)) = (
            edge.get(origin_key).and_then(Json::as_i64),
            edge.get(comp_key).and_then(Json::as_str),
            edge.get(id_key).and_then(Json::as_i64),
        ) else {
            continue;
        };
        let rel_type = edge
            .get("type")
            .and_then(Json::as_str)
            .map(|s| s.to_string());
        by_origin
            .entry(origin)
            .or_default()
            .push((other_comp.to_string(), other_id, rel_type));
    }

    for node in nodes.iter_mut() {
        let Some(id) = node.id() else { continue };
        let Some(links) = by_origin.get(&id) else {
            continue;
        };
        for (other_comp, other_id, rel_type) in links.clone() {
            if !ctx.registry.contains_key(&other_comp) {
                log::warn!(
                    "edge references unregistered component {:?}, skipping branch",
                    other_comp
                );
                continue;
            }
            let children = node.children_mut().entry(other_comp.clone()).or_default();
            expand_child(
                ctx,
                &other_comp,
                other_id,
                rel_type,
                children,
                depth + 1,
                limit,
                dir,
            )?;
        }
    }
    Ok(())
}
