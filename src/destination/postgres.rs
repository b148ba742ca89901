use crate::db_types::{ConnectionConfig, DatabaseType, RowValue};
use crate::destination::{Destination, DestinationTransaction};
use crate::insert::{quote_table_name, ColumnTypes, InsertStatement};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{ConnectOptions, Pool, Postgres, Row, Transaction};
use std::str::FromStr;

pub struct PostgresDestination {
    pool: Pool<Postgres>,
}

impl PostgresDestination {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, String> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| format!("Invalid PostgreSQL url: {}", e))?
            .log_statements(log::LevelFilter::Debug);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                let err_msg = e.to_string();
                if err_msg.contains("connection refused") {
                    return "Connection Refused\n\nCheck if PostgreSQL is running".to_string();
                }
                format!("Failed to create pool: {}", e)
            })?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q RowValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        RowValue::Null => query.bind(None::<String>),
        RowValue::Bool(v) => query.bind(*v),
        RowValue::Int(v) => query.bind(*v),
        RowValue::Float(v) => query.bind(*v),
        RowValue::Text(v) => query.bind(v.as_str()),
        RowValue::Timestamp(v) => query.bind(*v),
    }
}

/// Without a length modifier `bit` means `bit(1)`, which would truncate.
fn cast_target(data_type: String) -> String {
    match data_type.as_str() {
        "bit" => "bit varying".to_string(),
        "bit[]" => "bit varying[]".to_string(),
        _ => data_type,
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DestinationTransaction for PostgresTransaction {
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

    /// Text parameters are sent typed, and PostgreSQL only converts text to
    /// types such as uuid or date through an explicit cast.
    async fn column_types(&mut self, table: &str) -> Result<ColumnTypes, String> {
        let rows = sqlx::query(
            r#"
            SELECT a.attname::text AS column_name,
                   format_type(a.atttypid, NULL) AS data_type
            FROM pg_catalog.pg_attribute a
            WHERE a.attrelid = to_regclass($1)
              AND a.attnum > 0
              AND NOT a.attisdropped
            "#,
        )
        .bind(quote_table_name(&DatabaseType::PostgreSQL, table))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| format!("Failed to read column types of '{}': {}", table, e))?;

        let mut types = ColumnTypes::new();
        for row in rows {
            let column: String = row
                .try_get("column_name")
                .map_err(|e| format!("Invalid column name: {}", e))?;
            let data_type: String = row
                .try_get("data_type")
                .map_err(|e| format!("Invalid column type: {}", e))?;
            types.insert(column, cast_target(data_type));
        }
        Ok(types)
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
impl Destination for PostgresDestination {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>, String> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("Failed to begin transaction: {}", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn count_rows(&self, table: &str) -> Result<i64, String> {
        let query = format!(
            "SELECT COUNT(*) FROM {}",
            quote_table_name(&DatabaseType::PostgreSQL, table)
        );
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| format!("Failed to count rows of '{}': {}", table, e))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| format!("Count value is invalid: {}", e))
    }
}
