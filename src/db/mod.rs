use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use serde_json::Value as Json;
use std::path::Path;
use tokio::task;

use crate::error::{CompgraphError, Result};

/// A row materialized from storage, keyed by column name.
pub type Row = serde_json::Map<String, Json>;

/// Database connection wrapper
pub struct Db {
    path: std::path::PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Open a new database connection with optimized pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(CompgraphError::Database)?;
        apply_pragmas(&conn)?;
        Ok(conn)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path).map_err(CompgraphError::Database)?;
            apply_pragmas(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CompgraphError::Config(format!("blocking task join failed: {}", e)))?
    }
}

/// Set SQLite pragmas for performance.
/// WAL mode for better concurrency, NORMAL sync for speed, foreign keys for
/// integrity, in-memory temp store, 64MB page cache, memory-mapped I/O.
fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536; \
         PRAGMA mmap_size = 268435456;",
    )?;
    Ok(())
}

/// Binds a JSON value as an SQL parameter for dynamically compiled queries.
pub(crate) struct SqlParam<'a>(pub &'a Json);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Json::Null => ToSqlOutput::Owned(SqlValue::Null),
            Json::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ToSqlOutput::Owned(SqlValue::Integer(i))
                } else {
                    ToSqlOutput::Owned(SqlValue::Real(n.as_f64().unwrap_or(0.0)))
                }
            }
            Json::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            // Arrays and objects are stored in their JSON text form
            other => ToSqlOutput::Owned(SqlValue::Text(other.to_string())),
        })
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => {
            log::debug!("blob column encountered in dynamic query, returning null");
            Json::Null
        }
    }
}

/// Run a dynamically compiled SELECT, returning each row as a column-keyed map.
pub fn query_rows(conn: &Connection, sql: &str, params: &[Json]) -> Result<Vec<Row>> {
    log::debug!("query: {} params: {:?}", sql, params);
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(SqlParam)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (i, column) in columns.iter().enumerate() {
            record.insert(column.clone(), value_ref_to_json(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

/// Run a dynamically compiled INSERT/UPDATE/DELETE, returning affected rows.
pub fn execute(conn: &Connection, sql: &str, params: &[Json]) -> Result<usize> {
    log::debug!("execute: {} params: {:?}", sql, params);
    let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter().map(SqlParam)))?;
    Ok(changed)
}

pub mod schema;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_db_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);

        let result = db
            .with_connection(|conn| {
                conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])
                    .map_err(CompgraphError::Database)?;
                Ok(())
            })
            .await;

        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_pragmas_set() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);

        db.with_connection(|conn| {
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(journal_mode.to_uppercase(), "WAL");

            let foreign_keys: i32 =
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
            assert_eq!(foreign_keys, 1);

            Ok::<(), CompgraphError>(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_query_rows_json_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sample (id INTEGER PRIMARY KEY, name TEXT, score REAL, flag INTEGER);
             INSERT INTO sample (name, score, flag) VALUES ('asuka', 1.5, 1);
             INSERT INTO sample (name, score, flag) VALUES (NULL, NULL, 0);",
        )
        .unwrap();

        let rows = query_rows(&conn, "SELECT * FROM sample ORDER BY id", &[]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("asuka"));
        assert_eq!(rows[0]["score"], json!(1.5));
        assert_eq!(rows[0]["flag"], json!(1));
        assert_eq!(rows[1]["name"], Json::Null);
    }

    #[test]
    fn test_typed_params_bind() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE sample (id INTEGER PRIMARY KEY, name TEXT, n INTEGER);")
            .unwrap();
        execute(
            &conn,
            "INSERT INTO sample (name, n) VALUES (?, ?)",
            &[json!("rei"), json!(7)],
        )
        .unwrap();
        let rows = query_rows(
            &conn,
            "SELECT * FROM sample WHERE name = ? AND n = ?",
            &[json!("rei"), json!(7)],
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], json!(7));
    }
}
