use super::{Backend, Dialect, SqlRow, SqlValue};
use crate::error::StoreResult;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Networked store over a `sqlx` connection pool.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        debug!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param.clone() {
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &PgRow, columns: &Arc<Vec<String>>) -> StoreResult<SqlRow> {
    let mut cells = Vec::with_capacity(columns.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT8" => SqlValue::Integer(row.try_get::<Option<i64>, _>(idx)?),
            "INT4" => SqlValue::Integer(row.try_get::<Option<i32>, _>(idx)?.map(i64::from)),
            "INT2" => SqlValue::Integer(row.try_get::<Option<i16>, _>(idx)?.map(i64::from)),
            "BOOL" => SqlValue::Integer(row.try_get::<Option<bool>, _>(idx)?.map(i64::from)),
            "FLOAT8" => SqlValue::Real(row.try_get::<Option<f64>, _>(idx)?),
            "FLOAT4" => SqlValue::Real(row.try_get::<Option<f32>, _>(idx)?.map(f64::from)),
            _ => SqlValue::Text(row.try_get::<Option<String>, _>(idx)?),
        };
        cells.push(value);
    }
    Ok(SqlRow::new(columns.clone(), cells))
}

#[async_trait]
impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<u64> {
        let sql = self.dialect().bind_placeholders(sql);
        let result = bind_all(sqlx::query(&sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<SqlRow>> {
        let sql = self.dialect().bind_placeholders(sql);
        let rows = bind_all(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<Vec<String>> = Arc::new(
            first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        );
        rows.iter().map(|row| decode_row(row, &columns)).collect()
    }

    async fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}
