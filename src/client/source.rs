use crate::client::params::bind_named_parameters;
use crate::db_types::{ConnectionConfig, DatabaseType, IncomingRow, RowValue};
use crate::destination::{bind_mysql_value, bind_postgres_value, bind_sqlite_value};
use crate::schema::SchemaEntry;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgTypeKind};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::types::{BigDecimal, Uuid};
use sqlx::{Column, ConnectOptions, MySql, Pool, Postgres, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;

/// Supplies the rows of one schema entry.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch(&self, entry: &SchemaEntry) -> Result<Vec<IncomingRow>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Integer,
    Float,
    Boolean,
    Timestamp,
    Text,
}

/// Storage class for SQLite, where declared types are only affinities.
fn classify(type_name: &str) -> ValueKind {
    let upper = type_name.to_ascii_uppercase();
    if upper.contains("BOOL") {
        ValueKind::Boolean
    } else if upper.contains("INT") {
        ValueKind::Integer
    } else if upper.contains("FLOAT") || upper.contains("DOUBLE") || upper == "REAL" {
        ValueKind::Float
    } else if upper.contains("TIMESTAMP") || upper.contains("DATETIME") {
        ValueKind::Timestamp
    } else {
        ValueKind::Text
    }
}

// --- Row decoding ---

fn unsupported(column: &str, type_name: &str) -> String {
    format!(
        "Column '{}' has unsupported type {}; cast it to text in the source query",
        column, type_name
    )
}

fn bytea_literal(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(2 + bytes.len() * 2);
    text.push_str("\\x");
    for byte in bytes {
        text.push_str(&format!("{:02x}", byte));
    }
    text
}

/// Values arrive in PostgreSQL's binary format, so every type is decoded
/// through its own sqlx mapping.
fn pg_value(row: &PgRow, index: usize) -> Result<RowValue, String> {
    let column = &row.columns()[index];
    let raw = row
        .try_get_raw(index)
        .map_err(|e| format!("Failed to read column '{}': {}", column.name(), e))?;
    if raw.is_null() {
        return Ok(RowValue::Null);
    }
    let type_info = column.type_info();
    let type_name = type_info.name();
    let value = match type_name {
        "BOOL" => row.try_get::<bool, _>(index).map(RowValue::Bool),
        "INT2" => row.try_get::<i16, _>(index).map(|v| RowValue::Int(i64::from(v))),
        "INT4" => row.try_get::<i32, _>(index).map(|v| RowValue::Int(i64::from(v))),
        "INT8" => row.try_get::<i64, _>(index).map(RowValue::Int),
        "FLOAT4" => row.try_get::<f32, _>(index).map(|v| RowValue::Float(f64::from(v))),
        "FLOAT8" => row.try_get::<f64, _>(index).map(RowValue::Float),
        "NUMERIC" => row
            .try_get::<BigDecimal, _>(index)
            .map(|v| RowValue::Text(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            row.try_get::<String, _>(index).map(RowValue::Text)
        }
        "UUID" => row.try_get::<Uuid, _>(index).map(|v| RowValue::Text(v.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|v| RowValue::Text(v.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|v| RowValue::Text(v.format("%H:%M:%S%.f").to_string())),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|v| RowValue::Timestamp(v.and_utc())),
        "TIMESTAMPTZ" => row.try_get::<DateTime<Utc>, _>(index).map(RowValue::Timestamp),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(index)
            .map(|v| RowValue::Text(v.to_string())),
        "BYTEA" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|v| RowValue::Text(bytea_literal(&v))),
        // The binary form of an enum value is its label.
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => {
            row.try_get_unchecked::<String, _>(index).map(RowValue::Text)
        }
        other => return Err(unsupported(column.name(), other)),
    };
    value.map_err(|e| format!("Failed to read column '{}' ({}): {}", column.name(), type_name, e))
}

fn mysql_value(row: &MySqlRow, index: usize) -> Result<RowValue, String> {
    let column = &row.columns()[index];
    let raw = row
        .try_get_raw(index)
        .map_err(|e| format!("Failed to read column '{}': {}", column.name(), e))?;
    if raw.is_null() {
        return Ok(RowValue::Null);
    }
    let type_name = column.type_info().name();
    let value = match type_name {
        "BOOLEAN" => row.try_get::<bool, _>(index).map(RowValue::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(index).map(RowValue::Int)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "BIT" | "YEAR" => match row.try_get::<u64, _>(index) {
            Ok(v) => {
                let v = i64::try_from(v).map_err(|_| {
                    format!("Column '{}' value {} does not fit a signed 64-bit integer", column.name(), v)
                })?;
                Ok(RowValue::Int(v))
            }
            Err(e) => Err(e),
        },
        "FLOAT" => row.try_get::<f32, _>(index).map(|v| RowValue::Float(f64::from(v))),
        "DOUBLE" => row.try_get::<f64, _>(index).map(RowValue::Float),
        "DECIMAL" => row
            .try_get::<BigDecimal, _>(index)
            .map(|v| RowValue::Text(v.to_string())),
        "DATE" => row
            .try_get::<NaiveDate, _>(index)
            .map(|v| RowValue::Text(v.format("%Y-%m-%d").to_string())),
        "TIME" => row
            .try_get::<NaiveTime, _>(index)
            .map(|v| RowValue::Text(v.format("%H:%M:%S%.f").to_string())),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(index)
            .map(|v| RowValue::Timestamp(v.and_utc())),
        "TIMESTAMP" => row.try_get::<DateTime<Utc>, _>(index).map(RowValue::Timestamp),
        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM" | "SET" => {
            row.try_get::<String, _>(index).map(RowValue::Text)
        }
        "JSON" => row
            .try_get::<serde_json::Value, _>(index)
            .map(|v| RowValue::Text(v.to_string())),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            let bytes = row
                .try_get::<Vec<u8>, _>(index)
                .map_err(|e| format!("Failed to read column '{}' ({}): {}", column.name(), type_name, e))?;
            let text = String::from_utf8(bytes).map_err(|_| {
                format!("Column '{}' holds binary data that is not valid UTF-8", column.name())
            })?;
            Ok(RowValue::Text(text))
        }
        other => return Err(unsupported(column.name(), other)),
    };
    value.map_err(|e| format!("Failed to read column '{}' ({}): {}", column.name(), type_name, e))
}

fn sqlite_value(row: &SqliteRow, index: usize) -> Result<RowValue, String> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| format!("Failed to read column '{}': {}", row.columns()[index].name(), e))?;
    if raw.is_null() {
        return Ok(RowValue::Null);
    }
    // SQLite reports the declared column type when there is one and the
    // storage class of the value otherwise.
    let declared = row.columns()[index].type_info().name().to_string();
    let kind = classify(&declared);
    let value = match kind {
        ValueKind::Integer => row.try_get::<i64, _>(index).map(RowValue::Int),
        ValueKind::Float => row.try_get::<f64, _>(index).map(RowValue::Float),
        ValueKind::Boolean => row.try_get::<bool, _>(index).map(RowValue::Bool),
        ValueKind::Timestamp => row
            .try_get::<DateTime<Utc>, _>(index)
            .or_else(|_| row.try_get::<NaiveDateTime, _>(index).map(|v| v.and_utc()))
            .map(RowValue::Timestamp),
        ValueKind::Text => row.try_get::<String, _>(index).map(RowValue::Text),
    };
    // A value stored under another affinity is read by its storage class.
    value
        .or_else(|_| row.try_get_unchecked::<i64, _>(index).map(RowValue::Int))
        .or_else(|_| row.try_get_unchecked::<f64, _>(index).map(RowValue::Float))
        .or_else(|_| row.try_get_unchecked::<String, _>(index).map(RowValue::Text))
        .map_err(|e| format!("Failed to read column '{}': {}", row.columns()[index].name(), e))
}

fn to_incoming<R, F>(row: &R, read: F) -> Result<IncomingRow, String>
where
    R: Row,
    F: Fn(&R, usize) -> Result<RowValue, String>,
{
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| Ok((column.name().to_string(), read(row, index)?)))
        .collect()
}

// --- Source pools ---

pub enum SourcePool {
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
    Sqlite(Pool<Sqlite>),
}

impl SourcePool {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, String> {
        match config.db_type {
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(&config.url)
                    .map_err(|e| format!("Invalid PostgreSQL url: {}", e))?
                    .log_statements(log::LevelFilter::Debug);
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(options)
                    .await
                    .map(SourcePool::Postgres)
                    .map_err(|e| format!("Failed to connect to source: {}", e))
            }
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&config.url)
                    .map_err(|e| format!("Invalid MySQL url: {}", e))?
                    .log_statements(log::LevelFilter::Debug);
                MySqlPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(options)
                    .await
                    .map(SourcePool::MySql)
                    .map_err(|e| format!("Failed to connect to source: {}", e))
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.url)
                    .map_err(|e| format!("Invalid SQLite url: {}", e))?
                    .log_statements(log::LevelFilter::Debug);
                SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_with(options)
                    .await
                    .map(SourcePool::Sqlite)
                    .map_err(|e| format!("Failed to connect to source: {}", e))
            }
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            SourcePool::Postgres(_) => DatabaseType::PostgreSQL,
            SourcePool::MySql(_) => DatabaseType::MySQL,
            SourcePool::Sqlite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn fetch_rows(&self, query: &str, params: &[RowValue]) -> Result<Vec<IncomingRow>, String> {
        match self {
            SourcePool::Postgres(pool) => {
                let mut statement = sqlx::query(query);
                for value in params {
                    statement = bind_postgres_value(statement, value);
                }
                let rows = statement
                    .fetch_all(pool)
                    .await
                    .map_err(|e| format!("Query error: {}", e))?;
                rows.iter().map(|row| to_incoming(row, pg_value)).collect()
            }
            SourcePool::MySql(pool) => {
                let mut statement = sqlx::query(query);
                for value in params {
                    statement = bind_mysql_value(statement, value);
                }
                let rows = statement
                    .fetch_all(pool)
                    .await
                    .map_err(|e| format!("Query error: {}", e))?;
                rows.iter().map(|row| to_incoming(row, mysql_value)).collect()
            }
            SourcePool::Sqlite(pool) => {
                let mut statement = sqlx::query(query);
                for value in params {
                    statement = bind_sqlite_value(statement, value);
                }
                let rows = statement
                    .fetch_all(pool)
                    .await
                    .map_err(|e| format!("Query error: {}", e))?;
                rows.iter().map(|row| to_incoming(row, sqlite_value)).collect()
            }
        }
    }
}

/// Reads each entry's query from a source database, filling `@name`
/// references from `params`.
pub struct SqlSource {
    pool: SourcePool,
    params: HashMap<String, String>,
}

impl SqlSource {
    pub fn new(pool: SourcePool, params: HashMap<String, String>) -> Self {
        Self { pool, params }
    }
}

#[async_trait]
impl RowSource for SqlSource {
    async fn fetch(&self, entry: &SchemaEntry) -> Result<Vec<IncomingRow>, String> {
        if entry.query.trim().is_empty() {
            return Err(format!("Table '{}' has no source query", entry.name));
        }
        let style = self.pool.db_type().default_placeholder_style();
        let (query, params) = bind_named_parameters(&entry.query, style, &self.params)?;
        let rows = self.pool.fetch_rows(&query, &params).await?;
        log::info!("Read {} row(s) for '{}'", rows.len(), entry.name);
        Ok(rows)
    }
}
