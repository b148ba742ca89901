use crate::db_types::DatabaseType;
use crate::destination::{Destination, DestinationTransaction};
use crate::insert::{ColumnTypes, InsertStatement};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryState {
    committed: Vec<InsertStatement>,
    commits: usize,
    rollbacks: usize,
    type_lookups: usize,
}

/// Destination double that records statements instead of running them.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<MemoryState>>,
    fail_table: Option<String>,
    count_overrides: HashMap<String, i64>,
    count_failures: Vec<String>,
    column_types: HashMap<String, ColumnTypes>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement against `table` fails.
    pub fn failing_on(mut self, table: &str) -> Self {
        self.fail_table = Some(table.to_string());
        self
    }

    pub fn with_count(mut self, table: &str, count: i64) -> Self {
        self.count_overrides.insert(table.to_string(), count);
        self
    }

    pub fn with_count_failure(mut self, table: &str) -> Self {
        self.count_failures.push(table.to_string());
        self
    }

    pub fn with_column_type(mut self, table: &str, column: &str, data_type: &str) -> Self {
        self.column_types
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), data_type.to_string());
        self
    }

    pub fn type_lookups(&self) -> usize {
        self.state.lock().unwrap().type_lookups
    }

    pub fn committed(&self) -> Vec<InsertStatement> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    fail_table: Option<String>,
    column_types: HashMap<String, ColumnTypes>,
    pending: Vec<InsertStatement>,
}

#[async_trait]
impl DestinationTransaction for MemoryTransaction {
    async fn execute(&mut self, statement: &InsertStatement) -> Result<u64, String> {
        if self.fail_table.as_deref() == Some(statement.table.as_str()) {
            return Err(format!("Failed to insert into '{}': rejected", statement.table));
        }
        self.pending.push(statement.clone());
        Ok(statement.rows as u64)
    }

    async fn column_types(&mut self, table: &str) -> Result<ColumnTypes, String> {
        self.state.lock().unwrap().type_lookups += 1;
        Ok(self.column_types.get(table).cloned().unwrap_or_default())
    }

    async fn commit(self: Box<Self>) -> Result<(), String> {
        let this = *self;
        let mut state = this.state.lock().unwrap();
        state.committed.extend(this.pending);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), String> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>, String> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            fail_table: self.fail_table.clone(),
            column_types: self.column_types.clone(),
            pending: Vec::new(),
        }))
    }

    async fn count_rows(&self, table: &str) -> Result<i64, String> {
        if self.count_failures.iter().any(|name| name == table) {
            return Err(format!("Failed to count rows of '{}': relation does not exist", table));
        }
        if let Some(count) = self.count_overrides.get(table) {
            return Ok(*count);
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .committed
            .iter()
            .filter(|statement| statement.table == table)
            .map(|statement| statement.rows as i64)
            .sum())
    }
}
