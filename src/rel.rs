//! The shared edge table.
//!
//! Every typed, directed relationship between two component instances lives
//! in one `rel` table keyed by `(source_comp, source_id, target_comp,
//! target_id, type)`. A uniqueness constraint over that tuple plus a
//! find-before-insert writer makes edge insertion idempotent. Secondary
//! indexes on both endpoint pairs support traversal in either direction
//! without scanning.

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as Json;

use crate::component::Instance;
use crate::db;
use crate::error::{CompgraphError, Result};
use crate::query::{self, CompiledQuery, Filters};

/// Reserved component name of the shared edge table.
pub const REL_NAME: &str = "rel";

/// Traversal direction relative to the node being expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges pointing *into* the node (it is the target).
    Upstream,
    /// Edges the node points *to* (it is the source).
    Downstream,
}

/// One typed directed link between two component instances.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: Option<i64>,
    pub source_comp: String,
    pub source_id: i64,
    pub target_comp: String,
    pub target_id: i64,
    /// Role tag of the relationship, stored in the `type` column.
    pub rel_type: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl Edge {
    pub fn new(
        source_comp: impl Into<String>,
        source_id: i64,
        target_comp: impl Into<String>,
        target_id: i64,
        rel_type: Option<String>,
    ) -> Self {
        Self {
            id: None,
            source_comp: source_comp.into(),
            source_id,
            target_comp: target_comp.into(),
            target_id,
            rel_type,
            created_at: None,
            updated_at: None,
        }
    }
}

fn rel_table(prefix: &str) -> String {
    format!("{}{}", prefix, REL_NAME)
}

/// Idempotently ensure the edge table and its indexes exist.
pub fn ensure_schema(conn: &Connection, prefix: &str) -> Result<()> {
    let table = rel_table(prefix);
    db::schema::ident(&table)?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_comp TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                target_comp TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                type TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            table
        ),
        [],
    )?;
    // SQLite treats NULLs as distinct in unique indexes; the COALESCE keeps
    // untyped edges unique too.
    db::schema::ensure_index_on(
        conn,
        &table,
        "edge_uniq",
        "source_comp, source_id, target_comp, target_id, COALESCE(type, '')",
        true,
    )?;
    db::schema::ensure_index(
        conn,
        &table,
        &["target_comp".to_string(), "target_id".to_string()],
        false,
    )?;
    db::schema::ensure_index(
        conn,
        &table,
        &["source_comp".to_string(), "source_id".to_string()],
        false,
    )?;
    Ok(())
}

/// Insert an edge row, returning its new id.
pub fn insert_edge(conn: &Connection, prefix: &str, edge: &Edge) -> Result<i64> {
    conn.execute(
        &format!(
            "INSERT INTO \"{}\" (source_comp, source_id, target_comp, target_id, type) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rel_table(prefix)
        ),
        rusqlite::params![
            edge.source_comp,
            edge.source_id,
            edge.target_comp,
            edge.target_id,
            edge.rel_type,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Look up an edge by its endpoint tuple; a `None` type matches only
/// untyped edges.
pub fn find_edge(conn: &Connection, prefix: &str, edge: &Edge) -> Result<Option<Edge>> {
    let type_cond = match edge.rel_type {
        Some(_) => "type = ?5",
        None => "type IS NULL",
    };
    let sql = format!(
        "SELECT id, source_comp, source_id, target_comp, target_id, type, created_at, updated_at \
         FROM \"{}\" \
         WHERE source_comp = ?1 AND source_id = ?2 AND target_comp = ?3 AND target_id = ?4 AND {}",
        rel_table(prefix),
        type_cond
    );
    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Edge> {
        Ok(Edge {
            id: row.get(0)?,
            source_comp: row.get(1)?,
            source_id: row.get(2)?,
            target_comp: row.get(3)?,
            target_id: row.get(4)?,
            rel_type: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    };
    let found = match &edge.rel_type {
        Some(rel_type) => stmt
            .query_row(
                rusqlite::params![
                    edge.source_comp,
                    edge.source_id,
                    edge.target_comp,
                    edge.target_id,
                    rel_type,
                ],
                map_row,
            )
            .optional()?,
        None => stmt
            .query_row(
                rusqlite::params![
                    edge.source_comp,
                    edge.source_id,
                    edge.target_comp,
                    edge.target_id,
                ],
                map_row,
            )
            .optional()?,
    };
    Ok(found)
}

/// Materialize every row id matching a (possibly partial) instance.
fn materialize_ids(conn: &Connection, prefix: &str, inst: &Instance) -> Result<Vec<i64>> {
    let compiled = query::compile_select(prefix, inst, &Filters::rows_only())?;
    let rows = db::query_rows(conn, &compiled.sql, &compiled.params)?;
    let mut ids = Vec::new();
    for row in rows {
        if let Some(id) = row.get("id").and_then(Json::as_i64) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn require_ids(conn: &Connection, prefix: &str, inst: &Instance) -> Result<Vec<i64>> {
    let ids = materialize_ids(conn, prefix, inst)?;
    if ids.is_empty() {
        return Err(CompgraphError::Validation(format!(
            "missing relation endpoint: no {:?} row matches the given instance",
            inst.name()
        )));
    }
    Ok(ids)
}

fn upsert(conn: &Connection, prefix: &str, edge: &Edge) -> Result<bool> {
    if find_edge(conn, prefix, edge)?.is_some() {
        return Ok(false);
    }
    insert_edge(conn, prefix, edge)?;
    Ok(true)
}

/// Link every row matching each source instance to every row matching the
/// target instance. Repeated calls with the same arguments never create
/// duplicate edges. Returns the number of edges actually inserted.
pub fn upsert_upstream_edges(
    conn: &Connection,
    prefix: &str,
    target: &Instance,
    sources: &[Instance],
) -> Result<usize> {
    let target_ids = require_ids(conn, prefix, target)?;
    let mut inserted = 0;
    for source in sources {
        let rel_type = source.rel_type().map(|s| s.to_string());
        for source_id in require_ids(conn, prefix, source)? {
            for &target_id in &target_ids {
                let edge = Edge::new(
                    source.name(),
                    source_id,
                    target.name(),
                    target_id,
                    rel_type.clone(),
                );
                if upsert(conn, prefix, &edge)? {
                    inserted += 1;
                }
            }
        }
    }
    Ok(inserted)
}

/// Mirror image of [`upsert_upstream_edges`]: the given instance is the
/// source, each listed instance a target.
pub fn upsert_downstream_edges(
    conn: &Connection,
    prefix: &str,
    source: &Instance,
    targets: &[Instance],
) -> Result<usize> {
    let source_ids = require_ids(conn, prefix, source)?;
    let mut inserted = 0;
    for target in targets {
        let rel_type = target.rel_type().map(|s| s.to_string());
        for target_id in require_ids(conn, prefix, target)? {
            for &source_id in &source_ids {
                let edge = Edge::new(
                    source.name(),
                    source_id,
                    target.name(),
                    target_id,
                    rel_type.clone(),
                );
                if upsert(conn, prefix, &edge)? {
                    inserted += 1;
                }
            }
        }
    }
    Ok(inserted)
}

/// Delete all edges where the component is either endpoint.
pub fn delete_edges_for(conn: &Connection, prefix: &str, comp: &str, id: i64) -> Result<usize> {
    let changed = conn.execute(
        &format!(
            "DELETE FROM \"{}\" WHERE (source_comp = ?1 AND source_id = ?2) \
             OR (target_comp = ?1 AND target_id = ?2)",
            rel_table(prefix)
        ),
        rusqlite::params![comp, id],
    )?;
    Ok(changed)
}

/// Compile the batched edge fetch for one traversal fan-out step: all edges
/// incident to the given rows in the given direction, in id order.
pub(crate) fn edges_query(
    prefix: &str,
    comp: &str,
    ids: &[i64],
    dir: Direction,
) -> Result<CompiledQuery> {
    let table = rel_table(prefix);
    db::schema::ident(&table)?;
    let (comp_col, id_col) = match dir {
        Direction::Upstream => ("target_comp", "target_id"),
        Direction::Downstream => ("source_comp", "source_id"),
    };
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT id, source_comp, source_id, target_comp, target_id, type FROM \"{}\" \
         WHERE {} = ? AND {} IN ({}) ORDER BY id ASC",
        table, comp_col, id_col, placeholders
    );
    let mut params = vec![Json::from(comp)];
    params.extend(ids.iter().map(|id| Json::from(*id)));
    Ok(CompiledQuery { sql, params })
}
