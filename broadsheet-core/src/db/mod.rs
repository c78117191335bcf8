//! Storage adapter shared by the pipeline tables and the telemetry store.
//!
//! Business code talks to a [`Backend`] and writes portable SQL with `?`
//! placeholders. The two implementations differ only in the statements the
//! [`Dialect`] generates: auto-increment keys, placeholder syntax and catalog
//! introspection.

mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    pub fn auto_id(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    /// Expand `{auto_id}` in a schema template.
    pub fn render_ddl(&self, template: &str) -> String {
        template.replace("{auto_id}", self.auto_id())
    }

    /// Query returning one row when table `?` exists.
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            Dialect::Postgres => {
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = ?"
            }
        }
    }

    /// Rewrite `?` placeholders into the dialect's bind syntax. Question marks
    /// inside string literals are left alone.
    pub fn bind_placeholders<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        match self {
            Dialect::Sqlite => Cow::Borrowed(sql),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 16);
                let mut index = 0;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            index += 1;
                            out.push('$');
                            out.push_str(&index.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                Cow::Owned(out)
            }
        }
    }
}

/// A bind parameter or a column value. Nulls stay typed so PostgreSQL can
/// infer the parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(Option<i64>),
    Real(Option<f64>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            SqlValue::Integer(None) | SqlValue::Real(None) | SqlValue::Text(None)
        )
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(Some(v))
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(Some(v as i64))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(Some(v as i64))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(Some(v))
    }
}

impl From<Option<f64>> for SqlValue {
    fn from(v: Option<f64>) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(Some(v.to_string()))
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(Some(v))
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(Some(v.clone()))
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(v: Option<&str>) -> Self {
        SqlValue::Text(v.map(|s| s.to_string()))
    }
}

impl From<&Option<String>> for SqlValue {
    fn from(v: &Option<String>) -> Self {
        SqlValue::Text(v.clone())
    }
}

/// Build a `Vec<SqlValue>` from heterogeneous values.
#[macro_export]
macro_rules! sql_args {
    () => { Vec::<$crate::db::SqlValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::db::SqlValue::from($value)),+]
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    fn value(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
    }

    pub fn opt_int(&self, column: &str) -> StoreResult<Option<i64>> {
        match self.value(column) {
            Some(SqlValue::Integer(v)) => Ok(*v),
            Some(SqlValue::Real(v)) => Ok(v.map(|f| f as i64)),
            Some(SqlValue::Text(None)) => Ok(None),
            Some(SqlValue::Text(Some(s))) => s.parse().map(Some).map_err(|_| StoreError::Column {
                column: column.to_string(),
                expected: "integer",
            }),
            None => Err(StoreError::Column {
                column: column.to_string(),
                expected: "integer",
            }),
        }
    }

    pub fn int(&self, column: &str) -> StoreResult<i64> {
        self.opt_int(column)?.ok_or_else(|| StoreError::Column {
            column: column.to_string(),
            expected: "non-null integer",
        })
    }

    pub fn opt_real(&self, column: &str) -> StoreResult<Option<f64>> {
        match self.value(column) {
            Some(SqlValue::Real(v)) => Ok(*v),
            Some(SqlValue::Integer(v)) => Ok(v.map(|i| i as f64)),
            Some(SqlValue::Text(None)) => Ok(None),
            _ => Err(StoreError::Column {
                column: column.to_string(),
                expected: "real",
            }),
        }
    }

    pub fn opt_text(&self, column: &str) -> StoreResult<Option<String>> {
        match self.value(column) {
            Some(SqlValue::Text(v)) => Ok(v.clone()),
            Some(v) if v.is_null() => Ok(None),
            Some(SqlValue::Integer(Some(i))) => Ok(Some(i.to_string())),
            _ => Err(StoreError::Column {
                column: column.to_string(),
                expected: "text",
            }),
        }
    }

    pub fn text(&self, column: &str) -> StoreResult<String> {
        self.opt_text(column)?.ok_or_else(|| StoreError::Column {
            column: column.to_string(),
            expected: "non-null text",
        })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run one statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64>;

    /// Run one statement and collect its rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<SqlRow>>;

    /// Run several parameterless statements (schema definitions).
    async fn execute_batch(&self, sql: &str) -> StoreResult<()>;

    async fn query_one(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Option<SqlRow>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let sql = self.dialect().table_exists_sql();
        Ok(self
            .query_one(sql, &[SqlValue::from(table)])
            .await?
            .is_some())
    }
}

/// Open a backend from a database URL: `postgres://…` / `postgresql://…` for
/// the networked store, `sqlite://path`, `:memory:` or a bare path for the
/// embedded one.
pub async fn connect(url: &str) -> StoreResult<Arc<dyn Backend>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresBackend::connect(url).await?));
    }
    if url == ":memory:" || url == "sqlite::memory:" {
        return Ok(Arc::new(SqliteBackend::open_in_memory()?));
    }
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if path.is_empty() || path.contains("://") {
        return Err(StoreError::UnsupportedUrl(url.to_string()));
    }
    Ok(Arc::new(SqliteBackend::open(Path::new(path))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_rewritten_for_postgres() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = '?' AND c IN (?, ?)";
        assert_eq!(
            Dialect::Postgres.bind_placeholders(sql),
            "SELECT * FROM t WHERE a = $1 AND b = '?' AND c IN ($2, $3)"
        );
        assert_eq!(Dialect::Sqlite.bind_placeholders(sql), sql);
    }

    #[test]
    fn test_auto_id_rendering() {
        let template = "CREATE TABLE x (id {auto_id}, v TEXT)";
        assert_eq!(
            Dialect::Sqlite.render_ddl(template),
            "CREATE TABLE x (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)"
        );
        assert_eq!(
            Dialect::Postgres.render_ddl(template),
            "CREATE TABLE x (id BIGSERIAL PRIMARY KEY, v TEXT)"
        );
    }

    #[test]
    fn test_row_accessors() {
        let row = SqlRow::new(
            Arc::new(vec!["id".into(), "name".into(), "score".into(), "gone".into()]),
            vec![
                SqlValue::from(7i64),
                SqlValue::from("seven"),
                SqlValue::from(0.5),
                SqlValue::Text(None),
            ],
        );
        assert_eq!(row.int("id").unwrap(), 7);
        assert_eq!(row.text("NAME").unwrap(), "seven");
        assert_eq!(row.opt_real("score").unwrap(), Some(0.5));
        assert_eq!(row.opt_int("gone").unwrap(), None);
        assert!(row.int("gone").is_err());
        assert!(row.int("missing").is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        assert!(connect("mysql://localhost/db").await.is_err());
    }
}
