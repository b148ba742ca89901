use crate::db_types::{ConnectionConfig, DatabaseType, RowValue};
use crate::destination::{Destination, DestinationTransaction};
use crate::insert::{quote_table_name, InsertStatement};
use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlPoolOptions};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Pool, MySql, Row, Transaction};
use std::str::FromStr;

pub struct MySqlDestination {
    pool: Pool<MySql>,
}

impl MySqlDestination {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, String> {
        let options = MySqlConnectOptions::from_str(&config.url)
            .map_err(|e| format!("Invalid MySQL url: {}", e))?
            .log_statements(log::LevelFilter::Debug);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                let err_msg = e.to_string();
                if err_msg.contains("os error 111") {
                    return "Connection Refused\n\nCheck if MySQL is running".to_string();
                }
                format!("Failed to create pool: {}", e)
            })?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q RowValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        RowValue::Null => query.bind(None::<String>),
        RowValue::Bool(v) => query.bind(*v),
        RowValue::Int(v) => query.bind(*v),
        RowValue::Float(v) => query.bind(*v),
        RowValue::Text(v) => query.bind(v.as_str()),
        RowValue::Timestamp(v) => query.bind(*v),
    }
}

struct MySqlTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl DestinationTransaction for MySqlTransaction {
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
impl Destination for MySqlDestination {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>, String> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn count_rows(&self, table: &str) -> Result<i64, String> {
        let query = format!(
            "SELECT COUNT(*) FROM {}",
            quote_table_name(&DatabaseType::MySQL, table)
        );
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("Failed to count rows of '{}': {}", table, e))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| format!("Count value is invalid: {}", e))
    }
}
