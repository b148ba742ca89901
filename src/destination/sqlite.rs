use crate::db_types::{ConnectionConfig, DatabaseType, RowValue};
use crate::destination::{Destination, DestinationTransaction};
use crate::insert::{quote_table_name, InsertStatement};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Row, Sqlite, Transaction};
use std::str::FromStr;

pub struct SqliteDestination {
    pool: Pool<Sqlite>,
}

impl SqliteDestination {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, String> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| format!("Invalid SQLite url: {}", e))?
            .create_if_missing(true)
            .log_statements(log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| format!("Failed to create SQLite pool: {}", e))?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q RowValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        RowValue::Null => query.bind(None::<String>),
        RowValue::Bool(v) => query.bind(*v),
        RowValue::Int(v) => query.bind(*v),
        RowValue::Float(v) => query.bind(*v),
        RowValue::Text(v) => query.bind(v.as_str()),
        RowValue::Timestamp(v) => query.bind(*v),
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl DestinationTransaction for SqliteTransaction {
    async fn execute(&mut self, statement: &InsertStatement) -> Result<u64, String> {
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = bind_value(query, value);
        }
        query
            .execute(&mut *self.tx)
            .await
            .map(|result| result.rows_affected())
            .map_err(|e| format!("Failed to insert into '{}': {}", statement.table, e))
    }

    async fn commit(self: Box<Self>) -> Result<(), String> {
        self.tx
            .commit()
            .await
            .map_err(|e| format!("Failed to commit transaction: {}", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), String> {
        self.tx
            .rollback()
            .await
            .map_err(|e| format!("Failed to rollback transaction: {}", e))
    }
}

#[async_trait]
impl Destination for SqliteDestination {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>, String> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn count_rows(&self, table: &str) -> Result<i64, String> {
        let query = format!(
            "SELECT COUNT(*) FROM {}",
            quote_table_name(&DatabaseType::SQLite, table)
        );
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("Failed to count rows of '{}': {}", table, e))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| format!("Count value is invalid: {}", e))
    }
}
