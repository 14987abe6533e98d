//! Component definitions and instances.
//!
//! A *component* is a registered entity type: a name, a set of typed
//! attributes, and an integer `id` primary key. An [`Instance`] is a value of
//! such a type; instances with only some attributes set act as query
//! templates. The optional `rel_type` tag describes the role an instance
//! plays when used as a relationship endpoint or filter; it is never
//! persisted on the component's own row.

use rusqlite::Connection;
use serde_json::Value as Json;

use crate::db::schema::{self, ColumnSpec, ColumnType};
use crate::error::{CompgraphError, Result};

/// A value of a registered component type, or a partial query template.
#[derive(Debug, Clone)]
pub struct Instance {
    name: String,
    // Ordered: attribute order drives column projection order.
    attrs: Vec<(String, Option<Json>)>,
    rel_type: Option<String>,
}

impl Instance {
    /// Create a bare instance with no declared attributes.
    ///
    /// Prefer [`Component::instance`], which pre-declares the full attribute
    /// set so unset attributes still participate in column projection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            rel_type: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rel_type(&self) -> Option<&str> {
        self.rel_type.as_deref()
    }

    /// The reserved numeric primary key, when set.
    pub fn id(&self) -> Option<i64> {
        self.get("id").and_then(Json::as_i64)
    }

    /// Set an attribute value, declaring the attribute if needed.
    pub fn set(mut self, attr: impl Into<String>, value: impl Into<Json>) -> Self {
        let attr = attr.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(name, _)| *name == attr) {
            Some((_, slot)) => *slot = Some(value),
            None => self.attrs.push((attr, Some(value))),
        }
        self
    }

    /// Declare an attribute without giving it a value.
    pub fn declare(mut self, attr: impl Into<String>) -> Self {
        let attr = attr.into();
        if !self.attrs.iter().any(|(name, _)| *name == attr) {
            self.attrs.push((attr, None));
        }
        self
    }

    pub fn with_id(self, id: i64) -> Self {
        self.set("id", id)
    }

    pub fn with_rel_type(mut self, rel_type: impl Into<String>) -> Self {
        self.rel_type = Some(rel_type.into());
        self
    }

    /// The value of a defined attribute.
    pub fn get(&self, attr: &str) -> Option<&Json> {
        self.attrs
            .iter()
            .find(|(name, _)| name == attr)
            .and_then(|(_, value)| value.as_ref())
    }

    /// All declared attribute names, set or not, in declaration order.
    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|(name, _)| name.as_str())
    }

    /// Attributes with a defined value, in declaration order.
    pub fn defined_attrs(&self) -> impl Iterator<Item = (&str, &Json)> {
        self.attrs
            .iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.as_str(), v)))
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|(name, _)| name == attr)
    }
}

/// The contract every registered entity type implements.
pub trait Component: Send + Sync {
    /// Stable identifier; also the storage table name (behind the prefix).
    fn name(&self) -> &str;

    /// Idempotently ensure the backing table and indices exist.
    fn ensure_schema(&self, conn: &Connection, table_prefix: &str) -> Result<()>;

    /// A template instance declaring every attribute, all unset.
    fn instance(&self) -> Instance;
}

/// Declarative [`Component`] implementation built from column specs.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    name: String,
    columns: Vec<ColumnSpec>,
    uniques: Vec<Vec<String>>,
    indexes: Vec<Vec<String>>,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            uniques: Vec::new(),
            indexes: Vec::new(),
        }
    }

    fn column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            ty,
            not_null: false,
        });
        self
    }

    pub fn integer(self, name: &str) -> Self {
        self.column(name, ColumnType::Integer)
    }

    pub fn real(self, name: &str) -> Self {
        self.column(name, ColumnType::Real)
    }

    pub fn text(self, name: &str) -> Self {
        self.column(name, ColumnType::Text)
    }

    pub fn boolean(self, name: &str) -> Self {
        self.column(name, ColumnType::Boolean)
    }

    /// Mark the most recently added column NOT NULL.
    pub fn not_null(mut self) -> Self {
        if let Some(last) = self.columns.last_mut() {
            last.not_null = true;
        }
        self
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.uniques
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }
}

impl Component for ComponentDef {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_schema(&self, conn: &Connection, table_prefix: &str) -> Result<()> {
        let table = format!("{}{}", table_prefix, self.name);
        schema::ensure_table(conn, &table, &self.columns)?;
        for columns in &self.uniques {
            schema::ensure_index(conn, &table, columns, true)?;
        }
        for columns in &self.indexes {
            schema::ensure_index(conn, &table, columns, false)?;
        }
        Ok(())
    }

    fn instance(&self) -> Instance {
        let mut inst = Instance::new(self.name.clone()).declare("id");
        for column in &self.columns {
            inst = inst.declare(column.name.clone());
        }
        inst.declare("created_at").declare("updated_at")
    }
}

/// Reject an instance whose attributes are not a subset of its component's
/// declared attributes, before any storage call is issued.
pub(crate) fn validate_against(inst: &Instance, def: &dyn Component) -> Result<()> {
    let template = def.instance();
    for attr in inst.attr_names() {
        if !template.has_attr(attr) {
            return Err(CompgraphError::Validation(format!(
                "component {:?} has no attribute {:?}",
                inst.name(),
                attr
            )));
        }
    }
    if let Some(value) = inst.get("id") {
        if !value.is_i64() {
            return Err(CompgraphError::Validation(format!(
                "component {:?} id must be an integer, got {}",
                inst.name(),
                value
            )));
        }
    }
    Ok(())
}
