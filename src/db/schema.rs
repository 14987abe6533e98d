//! Idempotent schema creation for component tables.
//!
//! Every component table gets an autoincrementing `id` primary key and
//! `created_at`/`updated_at` timestamps; entity columns are declared through
//! [`ColumnSpec`]. All statements are `IF NOT EXISTS`, safe to re-run.

use rusqlite::Connection;

use crate::error::{CompgraphError, Result};

/// Storage type of a component attribute column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            // SQLite has no bool affinity; 0/1 integers by convention
            ColumnType::Boolean => "INTEGER",
        }
    }
}

/// One entity column of a component table.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub not_null: bool,
}

/// Validate a name used as a table or column identifier.
///
/// Identifiers are interpolated into SQL text (parameters cannot stand in for
/// them), so they are restricted to `[A-Za-z_][A-Za-z0-9_]*`.
pub fn ident(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(CompgraphError::Validation(format!(
            "invalid identifier: {:?}",
            name
        )))
    }
}

/// Check whether a table exists.
pub fn has_table(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Ensure a component table exists with the given entity columns.
pub fn ensure_table(conn: &Connection, table: &str, columns: &[ColumnSpec]) -> Result<()> {
    ident(table)?;
    let mut defs = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
    for column in columns {
        ident(&column.name)?;
        defs.push(format!(
            "\"{}\" {}{}",
            column.name,
            column.ty.sql(),
            if column.not_null { " NOT NULL" } else { "" }
        ));
    }
    defs.push("created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string());
    defs.push("updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string());

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table,
        defs.join(", ")
    );
    log::debug!("ensure table: {}", sql);
    conn.execute(&sql, [])?;
    Ok(())
}

/// Ensure a (possibly unique) index over plain columns exists.
pub fn ensure_index(conn: &Connection, table: &str, columns: &[String], unique: bool) -> Result<()> {
    ensure_index_on(
        conn,
        table,
        &columns.join("_"),
        &columns
            .iter()
            .map(|c| ident(c).map(|c| format!("\"{}\"", c)))
            .collect::<Result<Vec<_>>>()?
            .join(", "),
        unique,
    )
}

/// Ensure an index over raw column expressions exists. `tag` keeps the index
/// name stable and identifier-safe.
pub fn ensure_index_on(
    conn: &Connection,
    table: &str,
    tag: &str,
    expr: &str,
    unique: bool,
) -> Result<()> {
    ident(table)?;
    ident(tag)?;
    let sql = format!(
        "CREATE {}INDEX IF NOT EXISTS \"idx_{}_{}\" ON \"{}\" ({})",
        if unique { "UNIQUE " } else { "" },
        table,
        tag,
        table,
        expr
    );
    log::debug!("ensure index: {}", sql);
    conn.execute(&sql, [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                name: "username".to_string(),
                ty: ColumnType::Text,
                not_null: true,
            },
            ColumnSpec {
                name: "age".to_string(),
                ty: ColumnType::Integer,
                not_null: false,
            },
        ]
    }

    #[test]
    fn test_ident_accepts_valid_names() {
        assert!(ident("user").is_ok());
        assert!(ident("_private").is_ok());
        assert!(ident("cg_rel_2").is_ok());
    }

    #[test]
    fn test_ident_rejects_injection() {
        assert!(ident("").is_err());
        assert!(ident("1abc").is_err());
        assert!(ident("name; DROP TABLE x").is_err());
        assert!(ident("na me").is_err());
    }

    #[test]
    fn test_ensure_table_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn, "user", &sample_columns()).unwrap();
        // Second call is a no-op, not an error
        ensure_table(&conn, "user", &sample_columns()).unwrap();
        assert!(has_table(&conn, "user").unwrap());
        assert!(!has_table(&conn, "post").unwrap());
    }

    #[test]
    fn test_ensure_table_has_standard_columns() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn, "user", &sample_columns()).unwrap();
        conn.execute("INSERT INTO user (username) VALUES ('asuka')", [])
            .unwrap();
        let created: String = conn
            .query_row("SELECT created_at FROM user WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(!created.is_empty());
    }

    #[test]
    fn test_unique_index_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn, "user", &sample_columns()).unwrap();
        ensure_index(&conn, "user", &["username".to_string()], true).unwrap();
        conn.execute("INSERT INTO user (username) VALUES ('asuka')", [])
            .unwrap();
        let dup = conn.execute("INSERT INTO user (username) VALUES ('asuka')", []);
        assert!(dup.is_err());
    }
}
