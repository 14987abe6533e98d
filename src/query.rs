//! Compiles a component instance plus a filter specification into a concrete
//! bounded SQL query.
//!
//! Only attributes with a defined value become equality predicates; declared
//! but unset attributes still drive column projection. `relType` never
//! becomes a storage predicate. The compiler covers four query shapes: plain
//! filtered selection, aggregate projection, existence-based relation
//! filtering (set intersection across filter instances), and correlated
//! group-by against the edge table.

use serde_json::Value as Json;

use crate::component::Instance;
use crate::db::schema::ident;
use crate::error::{CompgraphError, Result};
use crate::rel::REL_NAME;

/// Sentinel limit meaning "no limit"; used by all internal selects.
pub const UNBOUNDED: i64 = -1;

/// Default page size for caller-facing selection.
pub const DEFAULT_LIMIT: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

/// One sort key of an `ORDER BY` list.
#[derive(Debug, Clone)]
pub struct OrderKey {
    pub column: String,
    pub dir: SortDir,
}

impl OrderKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            dir: SortDir::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            dir: SortDir::Desc,
        }
    }
}

/// An aggregate projection request: `{fn, args}` where `args` is a column
/// name or `*`. Unrecognized function names are silently dropped.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub func: String,
    pub args: String,
}

impl Aggregate {
    pub fn new(func: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: args.into(),
        }
    }
}

/// The closed vocabulary of aggregate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggFn {
    Avg,
    AvgDistinct,
    Count,
    CountDistinct,
    Min,
    Max,
    Sum,
    SumDistinct,
}

impl AggFn {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "avg" => Some(AggFn::Avg),
            "avgDistinct" => Some(AggFn::AvgDistinct),
            "count" => Some(AggFn::Count),
            "countDistinct" => Some(AggFn::CountDistinct),
            "min" => Some(AggFn::Min),
            "max" => Some(AggFn::Max),
            "sum" => Some(AggFn::Sum),
            "sumDistinct" => Some(AggFn::SumDistinct),
            _ => None,
        }
    }

    fn render(self, arg: &str) -> String {
        match self {
            AggFn::Avg => format!("AVG({})", arg),
            AggFn::AvgDistinct => format!("AVG(DISTINCT {})", arg),
            AggFn::Count => format!("COUNT({})", arg),
            AggFn::CountDistinct => format!("COUNT(DISTINCT {})", arg),
            AggFn::Min => format!("MIN({})", arg),
            AggFn::Max => format!("MAX({})", arg),
            AggFn::Sum => format!("SUM({})", arg),
            AggFn::SumDistinct => format!("SUM(DISTINCT {})", arg),
        }
    }
}

/// Correlated group-by specification: group the related `by` component's rows
/// over the edges pointing at the base selection.
#[derive(Debug, Clone)]
pub struct Group {
    pub by: Instance,
    pub columns: Vec<String>,
}

/// Escape-hatch predicate, ANDed onto the compiled `WHERE` clause last.
/// Column references should use the base table alias `t`.
#[derive(Debug, Clone, Default)]
pub struct SqlExpr {
    pub sql: String,
    pub params: Vec<Json>,
}

impl SqlExpr {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Json>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Recognized filter options for `get` and the query builder. All optional.
#[derive(Debug, Clone)]
pub struct Filters {
    /// Maximum upstream edge hops from the root; engine default when unset.
    pub upstream_limit: Option<u32>,
    /// Maximum downstream edge hops from the root; engine default when unset.
    pub downstream_limit: Option<u32>,
    /// Keep only rows related upstream to *every* one of these instances.
    pub filter_upstream_by: Vec<Instance>,
    /// Raw predicate applied last.
    pub where_expr: Option<SqlExpr>,
    /// Aggregate projections; when present, traversal fan-out is disabled.
    pub aggregate: Vec<Aggregate>,
    /// Correlated group-by.
    pub group: Option<Group>,
    /// Sort keys; defaults to `id` ascending for plain selections.
    pub order_by: Vec<OrderKey>,
    pub offset: u32,
    /// Row cap; [`UNBOUNDED`] (-1) means no limit.
    pub limit: i64,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            upstream_limit: None,
            downstream_limit: None,
            filter_upstream_by: Vec::new(),
            where_expr: None,
            aggregate: Vec::new(),
            group: None,
            order_by: Vec::new(),
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Filters {
    /// Unbounded selection with no fan-out, for internal row materialization.
    pub(crate) fn rows_only() -> Self {
        Self {
            limit: UNBOUNDED,
            ..Default::default()
        }
    }
}

/// A compiled SQL statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Json>,
}

fn table_name(prefix: &str, comp: &str) -> Result<String> {
    let name = format!("{}{}", prefix, comp);
    ident(&name)?;
    Ok(name)
}

/// `t."a", t."b", ...` over the instance's declared attributes, or `t.*`
/// for a bare instance that declares none.
fn projection(alias: &str, inst: &Instance) -> Result<String> {
    let mut cols = Vec::new();
    for attr in inst.attr_names() {
        ident(attr)?;
        cols.push(format!("{}.\"{}\"", alias, attr));
    }
    if cols.is_empty() {
        return Ok(format!("{}.*", alias));
    }
    Ok(cols.join(", "))
}

/// Equality predicates from the instance's defined attributes. A defined
/// JSON null compiles to `IS NULL`.
fn equality(
    alias: &str,
    inst: &Instance,
    conditions: &mut Vec<String>,
    params: &mut Vec<Json>,
) -> Result<()> {
    for (attr, value) in inst.defined_attrs() {
        ident(attr)?;
        if value.is_null() {
            conditions.push(format!("{}.\"{}\" IS NULL", alias, attr));
        } else {
            conditions.push(format!("{}.\"{}\" = ?", alias, attr));
            params.push(value.clone());
        }
    }
    Ok(())
}

/// One `EXISTS` condition against the edge table per filter instance.
/// The candidate row under evaluation is the edge target.
fn exists_condition(
    prefix: &str,
    alias: &str,
    target_comp: &str,
    filter: &Instance,
    params: &mut Vec<Json>,
) -> Result<String> {
    if filter.id().is_none() && filter.rel_type().is_none() {
        return Err(CompgraphError::MissingFilterKey(format!(
            "relation filter on {:?} needs an id or a relType",
            filter.name()
        )));
    }
    let rel_table = table_name(prefix, REL_NAME)?;
    let mut sql = format!(
        "EXISTS (SELECT 1 FROM \"{}\" WHERE source_comp = ? AND target_comp = ? AND target_id = {}.\"id\"",
        rel_table, alias
    );
    params.push(Json::from(filter.name()));
    params.push(Json::from(target_comp));
    if let Some(id) = filter.id() {
        sql.push_str(" AND source_id = ?");
        params.push(Json::from(id));
    }
    if let Some(rel_type) = filter.rel_type() {
        sql.push_str(" AND type = ?");
        params.push(Json::from(rel_type));
    }
    sql.push(')');
    Ok(sql)
}

/// Aggregate projections over `alias`, unknown function names dropped.
fn aggregate_projection(alias: &str, aggregates: &[Aggregate]) -> Result<Vec<String>> {
    let mut cols = Vec::new();
    for agg in aggregates {
        let Some(func) = AggFn::from_name(&agg.func) else {
            log::debug!("dropping unrecognized aggregate fn {:?}", agg.func);
            continue;
        };
        let arg = if agg.args == "*" {
            "*".to_string()
        } else {
            ident(&agg.args)?;
            format!("{}.\"{}\"", alias, agg.args)
        };
        ident(&agg.func)?;
        cols.push(format!("{} AS \"{}\"", func.render(&arg), agg.func));
    }
    Ok(cols)
}

fn order_clause(alias: &str, keys: &[OrderKey]) -> Result<String> {
    let mut parts = Vec::new();
    for key in keys {
        ident(&key.column)?;
        parts.push(format!(
            "{}.\"{}\" {}",
            alias,
            key.column,
            match key.dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            }
        ));
    }
    Ok(parts.join(", "))
}

fn check_limit(filters: &Filters) -> Result<()> {
    if filters.limit < UNBOUNDED {
        return Err(CompgraphError::Validation(format!(
            "limit must be -1 (unbounded) or non-negative, got {}",
            filters.limit
        )));
    }
    Ok(())
}

/// Compile the selection for a component instance under the given filters.
pub fn compile_select(prefix: &str, inst: &Instance, filters: &Filters) -> Result<CompiledQuery> {
    check_limit(filters)?;
    if let Some(group) = &filters.group {
        return compile_group(prefix, inst, filters, group);
    }

    let table = table_name(prefix, inst.name())?;
    let mut conditions = Vec::new();
    let mut params = Vec::new();

    equality("t", inst, &mut conditions, &mut params)?;
    for filter in &filters.filter_upstream_by {
        conditions.push(exists_condition(prefix, "t", inst.name(), filter, &mut params)?);
    }
    if let Some(expr) = &filters.where_expr {
        conditions.push(format!("({})", expr.sql));
        params.extend(expr.params.iter().cloned());
    }

    let select = if filters.aggregate.is_empty() {
        projection("t", inst)?
    } else {
        let cols = aggregate_projection("t", &filters.aggregate)?;
        if cols.is_empty() {
            // Every requested fn was unrecognized; fall back to plain rows
            projection("t", inst)?
        } else {
            cols.join(", ")
        }
    };

    let mut sql = format!("SELECT {} FROM \"{}\" AS t", select, table);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    if filters.aggregate.is_empty() {
        let order = if filters.order_by.is_empty() {
            "t.\"id\" ASC".to_string()
        } else {
            order_clause("t", &filters.order_by)?
        };
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    } else if !filters.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_clause("t", &filters.order_by)?);
    }
    sql.push_str(" LIMIT ? OFFSET ?");
    params.push(Json::from(filters.limit));
    params.push(Json::from(i64::from(filters.offset)));

    Ok(CompiledQuery { sql, params })
}

/// Compile the correlated group-by shape: the base filtered selection becomes
/// a subquery of ids, joined against the edge table restricted to
/// `source_comp = group.by`, projected and grouped on `group.by`'s table.
fn compile_group(
    prefix: &str,
    inst: &Instance,
    filters: &Filters,
    group: &Group,
) -> Result<CompiledQuery> {
    if group.columns.is_empty() {
        return Err(CompgraphError::Validation(
            "group.columns must not be empty".to_string(),
        ));
    }

    let by_table = table_name(prefix, group.by.name())?;
    let rel_table = table_name(prefix, REL_NAME)?;
    let base_table = table_name(prefix, inst.name())?;

    // Base subquery of candidate ids, with the full filter set applied.
    let mut base_conditions = Vec::new();
    let mut base_params = Vec::new();
    equality("t", inst, &mut base_conditions, &mut base_params)?;
    for filter in &filters.filter_upstream_by {
        base_conditions.push(exists_condition(
            prefix,
            "t",
            inst.name(),
            filter,
            &mut base_params,
        )?);
    }
    if let Some(expr) = &filters.where_expr {
        base_conditions.push(format!("({})", expr.sql));
        base_params.extend(expr.params.iter().cloned());
    }
    let mut base_sql = format!("SELECT t.\"id\" FROM \"{}\" AS t", base_table);
    if !base_conditions.is_empty() {
        base_sql.push_str(" WHERE ");
        base_sql.push_str(&base_conditions.join(" AND "));
    }
    base_sql.push_str(" LIMIT ? OFFSET ?");
    base_params.push(Json::from(filters.limit));
    base_params.push(Json::from(i64::from(filters.offset)));

    let mut group_cols = Vec::new();
    for column in &group.columns {
        ident(column)?;
        group_cols.push(format!("g.\"{}\"", column));
    }
    let mut select_cols = group_cols.clone();
    select_cols.extend(aggregate_projection("g", &filters.aggregate)?);

    let mut params = vec![Json::from(group.by.name()), Json::from(inst.name())];
    let mut sql = format!(
        "SELECT {} FROM \"{}\" AS g JOIN \"{}\" AS r ON r.source_comp = ? AND r.source_id = g.\"id\" \
         WHERE r.target_comp = ? AND r.target_id IN ({})",
        select_cols.join(", "),
        by_table,
        rel_table,
        base_sql
    );
    params.extend(base_params);

    // Constraints carried on the grouping instance itself
    let mut by_conditions = Vec::new();
    equality("g", &group.by, &mut by_conditions, &mut params)?;
    for condition in &by_conditions {
        sql.push_str(" AND ");
        sql.push_str(condition);
    }

    sql.push_str(" GROUP BY ");
    sql.push_str(&group_cols.join(", "));
    if !filters.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_clause("g", &filters.order_by)?);
    }

    Ok(CompiledQuery { sql, params })
}

/// Batched lookup of full rows for a set of ids, in id order. Used by the
/// result resolver.
pub(crate) fn compile_select_by_ids(
    prefix: &str,
    template: &Instance,
    ids: &[i64],
) -> Result<CompiledQuery> {
    let table = table_name(prefix, template.name())?;
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT {} FROM \"{}\" AS t WHERE t.\"id\" IN ({}) ORDER BY t.\"id\" ASC",
        projection("t", template)?,
        table,
        placeholders
    );
    let params = ids.iter().map(|id| Json::from(*id)).collect();
    Ok(CompiledQuery { sql, params })
}

/// Compile an insert of the instance's defined attributes.
pub(crate) fn compile_insert(prefix: &str, inst: &Instance) -> Result<CompiledQuery> {
    let table = table_name(prefix, inst.name())?;
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (attr, value) in inst.defined_attrs() {
        ident(attr)?;
        columns.push(format!("\"{}\"", attr));
        params.push(value.clone());
    }
    let sql = if columns.is_empty() {
        format!("INSERT INTO \"{}\" DEFAULT VALUES", table)
    } else {
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table,
            columns.join(", "),
            params.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        )
    };
    Ok(CompiledQuery { sql, params })
}

/// Compile a by-id patch of the given attributes, bumping `updated_at`.
pub(crate) fn compile_update_by_id(
    prefix: &str,
    patch: &Instance,
    id: i64,
) -> Result<CompiledQuery> {
    let table = table_name(prefix, patch.name())?;
    let mut sets = Vec::new();
    let mut params = Vec::new();
    for (attr, value) in patch.defined_attrs() {
        if attr == "id" {
            continue;
        }
        ident(attr)?;
        sets.push(format!("\"{}\" = ?", attr));
        params.push(value.clone());
    }
    if sets.is_empty() {
        return Err(CompgraphError::Validation(format!(
            "update patch for {:?} sets no attributes",
            patch.name()
        )));
    }
    sets.push("updated_at = CURRENT_TIMESTAMP".to_string());
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE id = ?",
        table,
        sets.join(", ")
    );
    params.push(Json::from(id));
    Ok(CompiledQuery { sql, params })
}

/// Compile a by-id row deletion.
pub(crate) fn compile_delete_by_id(prefix: &str, comp: &str, id: i64) -> Result<CompiledQuery> {
    let table = table_name(prefix, comp)?;
    Ok(CompiledQuery {
        sql: format!("DELETE FROM \"{}\" WHERE id = ?", table),
        params: vec![Json::from(id)],
    })
}
