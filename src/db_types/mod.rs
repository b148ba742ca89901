// =====================================================
// COMMON TYPES AND STRUCTURES
// Database kinds, placeholder styles and row values
// =====================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// --- Database Type Enum ---
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    MySQL,
    #[default]
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_driver_name(name: &str) -> Result<Self, String> {
        match name.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DatabaseType::PostgreSQL),
            "mysql" | "mariadb" => Ok(DatabaseType::MySQL),
            "sqlite" | "sqlite3" => Ok(DatabaseType::SQLite),
            other => Err(format!("Unsupported database driver '{}'", other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::MySQL => "mysql",
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::SQLite => "sqlite",
        }
    }

    pub fn default_placeholder_style(&self) -> PlaceholderStyle {
        match self {
            DatabaseType::PostgreSQL => PlaceholderStyle::Dollar,
            DatabaseType::MySQL | DatabaseType::SQLite => PlaceholderStyle::Question,
        }
    }
}

// --- Placeholder Style ---
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    #[default]
    Question,
    Dollar,
}

impl PlaceholderStyle {
    /// Renders the marker for a 1-based parameter position.
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${}", position),
        }
    }
}

// --- Connection Configuration ---
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub db_type: DatabaseType,
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl ConnectionConfig {
    pub fn new(db_type: DatabaseType, url: &str) -> Result<Self, String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("Connection url is required".to_string());
        }
        Ok(Self {
            db_type,
            url: url.to_string(),
            max_connections: default_max_connections(),
        })
    }

    pub fn from_driver(database: &str, url: &str) -> Result<Self, String> {
        Self::new(DatabaseType::from_driver_name(database)?, url)
    }
}

// --- Row Values ---

/// An untyped scalar read from a source row.
///
/// Serialized adjacently tagged so a timestamp is never confused with text
/// after a round-trip through a chunked payload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RowValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl RowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RowValue::Null)
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            RowValue::Null => "null",
            RowValue::Bool(_) => "bool",
            RowValue::Int(_) => "int",
            RowValue::Float(_) => "float",
            RowValue::Text(_) => "text",
            RowValue::Timestamp(_) => "timestamp",
        }
    }

    /// Text form used for lookup keys; `None` for null.
    pub fn to_key_text(&self) -> Option<String> {
        match self {
            RowValue::Null => None,
            RowValue::Bool(value) => Some(value.to_string()),
            RowValue::Int(value) => Some(value.to_string()),
            RowValue::Float(value) => Some(value.to_string()),
            RowValue::Text(value) => Some(value.trim().to_string()),
            RowValue::Timestamp(value) => Some(value.to_rfc3339()),
        }
    }
}

impl fmt::Display for RowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValue::Null => write!(f, "NULL"),
            RowValue::Bool(value) => write!(f, "{}", value),
            RowValue::Int(value) => write!(f, "{}", value),
            RowValue::Float(value) => write!(f, "{}", value),
            RowValue::Text(value) => write!(f, "'{}'", value),
            RowValue::Timestamp(value) => write!(f, "'{}'", value.to_rfc3339()),
        }
    }
}

impl From<i64> for RowValue {
    fn from(value: i64) -> Self {
        RowValue::Int(value)
    }
}

impl From<&str> for RowValue {
    fn from(value: &str) -> Self {
        RowValue::Text(value.to_string())
    }
}

impl From<String> for RowValue {
    fn from(value: String) -> Self {
        RowValue::Text(value)
    }
}

impl From<bool> for RowValue {
    fn from(value: bool) -> Self {
        RowValue::Bool(value)
    }
}

impl From<f64> for RowValue {
    fn from(value: f64) -> Self {
        RowValue::Float(value)
    }
}

impl From<DateTime<Utc>> for RowValue {
    fn from(value: DateTime<Utc>) -> Self {
        RowValue::Timestamp(value)
    }
}

impl<T: Into<RowValue>> From<Option<T>> for RowValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RowValue::Null)
    }
}

/// One source row keyed by source field name.
pub type IncomingRow = HashMap<String, RowValue>;
