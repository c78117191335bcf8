use super::{Backend, Dialect, SqlRow, SqlValue};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Embedded store. One connection guarded by a mutex; every call runs on the
/// blocking pool so the async runtime is never stalled by disk I/O.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        // Optimize for concurrent writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Task("sqlite connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Integer(Some(v)) => Value::Integer(*v),
        SqlValue::Real(Some(v)) => Value::Real(*v),
        SqlValue::Text(Some(v)) => Value::Text(v.clone()),
        _ => Value::Null,
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Text(None),
        ValueRef::Integer(v) => SqlValue::Integer(Some(v)),
        ValueRef::Real(v) => SqlValue::Real(Some(v)),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let sql = sql.to_string();
        let values: Vec<Value> = params.iter().map(to_value).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let changed = stmt.execute(params_from_iter(values.iter()))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<SqlRow>> {
        let sql = sql.to_string();
        let values: Vec<Value> = params.iter().map(to_value).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let columns: Arc<Vec<String>> = Arc::new(
                stmt.column_names()
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
            );
            let width = columns.len();
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut cells = Vec::with_capacity(width);
                for idx in 0..width {
                    cells.push(from_value_ref(row.get_ref(idx)?));
                }
                out.push(SqlRow::new(columns.clone(), cells));
            }
            Ok(out)
        })
        .await
    }

    async fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute_batch(&sql)?))
            .await
    }
}
