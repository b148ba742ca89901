// =====================================================
// DESTINATION DATABASE
// Transactions, parameterized execution and count queries
// =====================================================

mod mysql;
mod postgres;
mod sqlite;

#[cfg(test)]
pub(crate) mod memory;

pub use mysql::MySqlDestination;
pub use postgres::PostgresDestination;
pub use sqlite::SqliteDestination;

pub(crate) use mysql::bind_value as bind_mysql_value;
pub(crate) use postgres::bind_value as bind_postgres_value;
pub(crate) use sqlite::bind_value as bind_sqlite_value;

use crate::db_types::{ConnectionConfig, DatabaseType};
use crate::insert::{ColumnTypes, InsertStatement};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An open destination transaction.
#[async_trait]
pub trait DestinationTransaction: Send {
    /// Runs one statement and returns the affected row count.
    async fn execute(&mut self, statement: &InsertStatement) -> Result<u64, String>;

    /// Column type names bound values must be cast to, keyed by column.
    /// Empty for drivers that convert parameters on assignment.
    async fn column_types(&mut self, _table: &str) -> Result<ColumnTypes, String> {
        Ok(ColumnTypes::new())
    }

    async fn commit(self: Box<Self>) -> Result<(), String>;
    async fn rollback(self: Box<Self>) -> Result<(), String>;
}

#[async_trait]
pub trait Destination: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>, String>;

    /// Read-only count used by end-of-session verification.
    async fn count_rows(&self, table: &str) -> Result<i64, String>;
}

pub async fn connect_destination(config: &ConnectionConfig) -> Result<Arc<dyn Destination>, String> {
    let destination: Arc<dyn Destination> = match config.db_type {
        DatabaseType::PostgreSQL => Arc::new(PostgresDestination::connect(config).await?),
        DatabaseType::MySQL => Arc::new(MySqlDestination::connect(config).await?),
        DatabaseType::SQLite => Arc::new(SqliteDestination::connect(config).await?),
    };
    log::info!(
        "Connected to {} destination",
        destination.db_type().as_str()
    );
    Ok(destination)
}

// --- Shared Transaction ---

struct TransactionSlot {
    transaction: Option<Box<dyn DestinationTransaction>>,
    column_types: HashMap<String, Arc<ColumnTypes>>,
}

/// The session-wide transaction shared by every batch task.
///
/// Statements are serialized through the inner mutex. Once committed or
/// rolled back the handle is closed and further use is an error.
#[derive(Clone)]
pub struct SharedTransaction {
    inner: Arc<Mutex<TransactionSlot>>,
}

impl SharedTransaction {
    pub fn new(transaction: Box<dyn DestinationTransaction>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransactionSlot {
                transaction: Some(transaction),
                column_types: HashMap::new(),
            })),
        }
    }

    pub async fn execute(&self, statement: &InsertStatement) -> Result<u64, String> {
        let mut guard = self.inner.lock().await;
        let transaction = guard
            .transaction
            .as_mut()
            .ok_or_else(|| "Transaction is already closed".to_string())?;
        transaction.execute(statement).await
    }

    /// Column types of a destination table, looked up once per session.
    pub async fn column_types(&self, table: &str) -> Result<Arc<ColumnTypes>, String> {
        let mut guard = self.inner.lock().await;
        if let Some(types) = guard.column_types.get(table) {
            return Ok(Arc::clone(types));
        }
        let transaction = guard
            .transaction
            .as_mut()
            .ok_or_else(|| "Transaction is already closed".to_string())?;
        let types = Arc::new(transaction.column_types(table).await?);
        log::debug!("Column types for '{}': {:?}", table, types);
        guard.column_types.insert(table.to_string(), Arc::clone(&types));
        Ok(types)
    }

    pub async fn commit(&self) -> Result<(), String> {
        let transaction = self
            .inner
            .lock()
            .await
            .transaction
            .take()
            .ok_or_else(|| "Transaction is already closed".to_string())?;
        transaction.commit().await
    }

    /// Rolls back if still open; a closed handle is left alone.
    pub async fn rollback(&self) -> Result<(), String> {
        let transaction = self.inner.lock().await.transaction.take();
        match transaction {
            Some(transaction) => transaction.rollback().await,
            None => Ok(()),
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.transaction.is_some()
    }
}
