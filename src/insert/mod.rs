// =====================================================
// BULK INSERT BUILDER
// Multi-row INSERT statements bounded by a runtime row limit
// =====================================================

use crate::db_types::{DatabaseType, IncomingRow, PlaceholderStyle, RowValue};
use crate::destination::SharedTransaction;
use crate::error::FlockError;
use crate::functions::FunctionSet;
use crate::pipeline::transform_rows;
use crate::schema::Table;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_ROW_LIMIT: usize = 1_000;

// --- Row Limit ---

/// Maximum value tuples per INSERT, adjustable while sessions run.
#[derive(Debug)]
pub struct RowLimit {
    value: AtomicUsize,
}

impl Default for RowLimit {
    fn default() -> Self {
        Self {
            value: AtomicUsize::new(DEFAULT_ROW_LIMIT),
        }
    }
}

impl RowLimit {
    pub fn new(limit: i64) -> Result<Self, String> {
        let row_limit = Self::default();
        row_limit.set(limit)?;
        Ok(row_limit)
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    /// Non-positive values are rejected and leave the current limit as is.
    pub fn set(&self, limit: i64) -> Result<usize, String> {
        if limit <= 0 {
            return Err(format!("Row limit must be greater than 0, got {}", limit));
        }
        let limit = usize::try_from(limit)
            .map_err(|_| format!("Row limit {} is too large", limit))?;
        self.value.store(limit, Ordering::Relaxed);
        Ok(limit)
    }
}

// --- Statements ---

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    /// Unquoted destination table name.
    pub table: String,
    pub sql: String,
    pub params: Vec<RowValue>,
    /// Number of value tuples in `sql`.
    pub rows: usize,
}

/// Destination type name per column, used to cast bound values.
pub type ColumnTypes = HashMap<String, String>;

/// How statements are rendered for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertDialect {
    pub db_type: DatabaseType,
    pub placeholder_style: PlaceholderStyle,
}

impl InsertDialect {
    pub fn new(db_type: DatabaseType, placeholder_style: PlaceholderStyle) -> Self {
        Self {
            db_type,
            placeholder_style,
        }
    }
}

pub fn quote_identifier_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn quote_identifier_postgres(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_identifier(db_type: &DatabaseType, name: &str) -> String {
    match db_type {
        DatabaseType::MySQL => quote_identifier_mysql(name),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => quote_identifier_postgres(name),
    }
}

/// Quotes each dot-separated part, so `schema.table` stays qualified.
pub fn quote_table_name(db_type: &DatabaseType, name: &str) -> String {
    name.split('.')
        .map(|part| quote_identifier(db_type, part.trim()))
        .collect::<Vec<String>>()
        .join(".")
}

/// The override when given, otherwise the table's own name.
pub fn destination_name<'a>(table: &'a Table, dest_override: &'a str) -> &'a str {
    let trimmed = dest_override.trim();
    if trimmed.is_empty() {
        &table.name
    } else {
        trimmed
    }
}

fn insert_prefix(dialect: &InsertDialect, qualified_table: &str, quoted_columns: &str) -> String {
    match dialect.db_type {
        DatabaseType::MySQL => format!(
            "INSERT IGNORE INTO {} ({}) VALUES ",
            qualified_table, quoted_columns
        ),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => {
            format!("INSERT INTO {} ({}) VALUES ", qualified_table, quoted_columns)
        }
    }
}

fn ignore_suffix(dialect: &InsertDialect) -> &'static str {
    match dialect.db_type {
        DatabaseType::MySQL => "",
        DatabaseType::PostgreSQL | DatabaseType::SQLite => " ON CONFLICT DO NOTHING",
    }
}

fn quoted_columns(table: &Table, dialect: &InsertDialect) -> Result<String, String> {
    if table.order.is_empty() {
        return Err(format!(
            "Cannot build insert statement for table '{}' without columns",
            table.name
        ));
    }
    Ok(table
        .order
        .iter()
        .map(|column| quote_identifier(&dialect.db_type, column))
        .collect::<Vec<String>>()
        .join(", "))
}

/// Splits rows into `ceil(rows / limit)` statements in input order.
///
/// Nulls are written as `NULL` literals; every other value is bound, with
/// `$n` numbering restarting at 1 in each statement.
pub fn build_insert_statements(
    table: &Table,
    dest_override: &str,
    dialect: &InsertDialect,
    limit: usize,
    rows: &[Vec<RowValue>],
) -> Result<Vec<InsertStatement>, String> {
    build_typed_insert_statements(table, dest_override, dialect, limit, rows, &ColumnTypes::new())
}

fn placeholder(dialect: &InsertDialect, index: usize, column_type: Option<&String>) -> String {
    let marker = dialect.placeholder_style.placeholder(index);
    match column_type {
        Some(column_type) => format!("CAST({} AS {})", marker, column_type),
        None => marker,
    }
}

/// Like [`build_insert_statements`], casting each bound value to the type
/// listed for its column.
pub fn build_typed_insert_statements(
    table: &Table,
    dest_override: &str,
    dialect: &InsertDialect,
    limit: usize,
    rows: &[Vec<RowValue>],
    column_types: &ColumnTypes,
) -> Result<Vec<InsertStatement>, String> {
    if limit == 0 {
        return Err("Row limit must be greater than 0".to_string());
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let dest_name = destination_name(table, dest_override);
    let qualified_table = quote_table_name(&dialect.db_type, dest_name);
    let columns = quoted_columns(table, dialect)?;
    let prefix = insert_prefix(dialect, &qualified_table, &columns);
    let width = table.order.len();
    let casts: Vec<Option<&String>> = table
        .order
        .iter()
        .map(|column| column_types.get(column))
        .collect();

    let mut statements = Vec::with_capacity(rows.len().div_ceil(limit));
    for chunk in rows.chunks(limit) {
        let mut sql = prefix.clone();
        let mut params = Vec::with_capacity(chunk.len() * width);

        for (row_index, row) in chunk.iter().enumerate() {
            if row.len() != width {
                return Err(format!(
                    "Row has {} value(s) but table '{}' has {} column(s)",
                    row.len(),
                    table.name,
                    width
                ));
            }
            if row_index > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for (value_index, value) in row.iter().enumerate() {
                if value_index > 0 {
                    sql.push_str(", ");
                }
                if value.is_null() {
                    sql.push_str("NULL");
                } else {
                    params.push(value.clone());
                    sql.push_str(&placeholder(dialect, params.len(), casts[value_index]));
                }
            }
            sql.push(')');
        }

        sql.push_str(ignore_suffix(dialect));
        statements.push(InsertStatement {
            table: dest_name.to_string(),
            sql,
            params,
            rows: chunk.len(),
        });
    }

    Ok(statements)
}

fn escape_sql_string(db_type: &DatabaseType, value: &str) -> String {
    match db_type {
        DatabaseType::MySQL => value.replace('\\', "\\\\").replace('\'', "''"),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => value.replace('\'', "''"),
    }
}

fn value_to_sql_literal(db_type: &DatabaseType, value: &RowValue) -> String {
    match value {
        RowValue::Null => "NULL".to_string(),
        RowValue::Bool(v) => {
            if *v {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        RowValue::Int(v) => v.to_string(),
        RowValue::Float(v) => v.to_string(),
        RowValue::Text(v) => format!("'{}'", escape_sql_string(db_type, v)),
        RowValue::Timestamp(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.f")),
    }
}

/// Single-row statement with inlined literals, for logs and diagnostics.
pub fn build_single_insert_query(
    table: &Table,
    dest_override: &str,
    dialect: &InsertDialect,
    row: &[RowValue],
) -> Result<String, String> {
    let columns = quoted_columns(table, dialect)?;
    let qualified_table = quote_table_name(&dialect.db_type, destination_name(table, dest_override));
    let values = table
        .order
        .iter()
        .enumerate()
        .map(|(index, _)| {
            value_to_sql_literal(&dialect.db_type, row.get(index).unwrap_or(&RowValue::Null))
        })
        .collect::<Vec<String>>()
        .join(", ");

    Ok(format!(
        "{}({}){}",
        insert_prefix(dialect, &qualified_table, &columns),
        values,
        ignore_suffix(dialect)
    ))
}

// --- Execution ---

/// Transforms `rows` and writes them through the shared transaction.
///
/// Returns the number of value tuples sent to the destination.
pub async fn insert_bulk(
    transaction: &SharedTransaction,
    table: &Table,
    functions: &FunctionSet,
    dest_override: &str,
    dialect: &InsertDialect,
    limit: usize,
    rows: &[IncomingRow],
) -> Result<usize, FlockError> {
    let values = transform_rows(table, functions, rows)?;
    let column_types = transaction
        .column_types(destination_name(table, dest_override))
        .await
        .map_err(FlockError::Persistence)?;
    let statements =
        build_typed_insert_statements(table, dest_override, dialect, limit, &values, &column_types)
            .map_err(FlockError::Persistence)?;

    if let Some(first) = values.first() {
        if let Ok(preview) = build_single_insert_query(table, dest_override, dialect, first) {
            log::debug!("First row for '{}': {}", table.name, preview);
        }
    }

    let mut written = 0;
    for statement in &statements {
        transaction
            .execute(statement)
            .await
            .map_err(FlockError::Persistence)?;
        written += statement.rows;
    }

    log::debug!(
        "Inserted {} row(s) into '{}' using {} statement(s)",
        written,
        destination_name(table, dest_override),
        statements.len()
    );
    Ok(written)
}
