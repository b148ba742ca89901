// =====================================================
// CHUNK REASSEMBLY & BATCH DISPATCHER
// One concurrent task per batch, fed by the session loop
// =====================================================

use crate::db_types::IncomingRow;
use crate::destination::SharedTransaction;
use crate::error::FlockError;
use crate::functions::FunctionSet;
use crate::insert::{insert_bulk, InsertDialect, RowLimit};
use crate::protocol::{decode_rows, ServerMessage};
use crate::schema::{Table, TableMap};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

// --- First Error Slot ---

#[derive(Default)]
struct FirstErrorInner {
    slot: OnceLock<FlockError>,
    notify: Notify,
}

/// Set-once error shared by the session loop and every batch task.
#[derive(Clone, Default)]
pub struct FirstError {
    inner: Arc<FirstErrorInner>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call stored the error.
    pub fn record(&self, error: FlockError) -> bool {
        let stored = self.inner.slot.set(error).is_ok();
        if stored {
            self.inner.notify.notify_waiters();
        }
        stored
    }

    pub fn get(&self) -> Option<FlockError> {
        self.inner.slot.get().cloned()
    }

    pub fn is_set(&self) -> bool {
        self.inner.slot.get().is_some()
    }

    /// Resolves once an error has been recorded.
    pub async fn wait(&self) -> FlockError {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(error) = self.get() {
                return error;
            }
            notified.await;
        }
    }
}

// --- Reassembly ---

/// Concatenates chunk payloads in index order, whatever the arrival order.
pub fn reassemble(mut chunks: Vec<(usize, Vec<u8>)>) -> Vec<u8> {
    chunks.sort_by_key(|(index, _)| *index);
    let total = chunks.iter().map(|(_, payload)| payload.len()).sum();
    let mut payload = Vec::with_capacity(total);
    for (_, chunk) in chunks {
        payload.extend_from_slice(&chunk);
    }
    payload
}

/// Everything a batch task needs from its session.
#[derive(Clone)]
pub struct BatchContext {
    pub transaction: SharedTransaction,
    pub tables: Arc<TableMap>,
    pub functions: Arc<FunctionSet>,
    pub dialect: InsertDialect,
    pub row_limit: Arc<RowLimit>,
    pub outbound: mpsc::Sender<ServerMessage>,
    pub first_error: FirstError,
}

struct BatchUnit {
    sender: Option<mpsc::UnboundedSender<(usize, Vec<u8>)>>,
    expected: usize,
    received: HashSet<usize>,
}

impl BatchUnit {
    fn is_complete(&self) -> bool {
        self.received.len() == self.expected
    }
}

struct BatchJob {
    batch_id: String,
    table: Arc<Table>,
    dest_table_name: String,
    expected: usize,
}

async fn insert_payload(
    context: &BatchContext,
    job: &BatchJob,
    payload: &[u8],
) -> Result<usize, FlockError> {
    let rows: Vec<IncomingRow> = decode_rows(payload).map_err(|e| {
        FlockError::protocol(format!("batch '{}': {}", job.batch_id, e))
    })?;
    insert_bulk(
        &context.transaction,
        &job.table,
        &context.functions,
        &job.dest_table_name,
        &context.dialect,
        context.row_limit.get(),
        &rows,
    )
    .await
}

async fn run_batch(
    context: BatchContext,
    job: BatchJob,
    mut chunks_rx: mpsc::UnboundedReceiver<(usize, Vec<u8>)>,
) {
    let mut chunks = Vec::with_capacity(job.expected);
    while chunks.len() < job.expected {
        match chunks_rx.recv().await {
            Some(chunk) => chunks.push(chunk),
            None => {
                log::debug!("Batch '{}' abandoned before completion", job.batch_id);
                return;
            }
        }
    }

    if context.first_error.is_set() {
        return;
    }

    let payload = reassemble(chunks);
    match insert_payload(&context, &job, &payload).await {
        Ok(written) => {
            if context.first_error.is_set() {
                return;
            }
            log::info!(
                "Batch '{}' inserted {} row(s) into '{}'",
                job.batch_id,
                written,
                job.table.name
            );
            let result = ServerMessage::BatchInsertResult {
                batch_id: job.batch_id.clone(),
                success: true,
            };
            if context.outbound.send(result).await.is_err() {
                log::warn!("Client went away before batch '{}' was acknowledged", job.batch_id);
            }
        }
        Err(error) => {
            log::error!("Batch '{}' failed: {}", job.batch_id, error);
            context.first_error.record(error);
        }
    }
}

// --- Dispatcher ---

/// Routes batch messages to per-batch tasks and validates their sequence.
pub struct BatchDispatcher {
    context: BatchContext,
    units: HashMap<String, BatchUnit>,
    closed: HashSet<String>,
    dest_names: HashMap<String, String>,
    tasks: JoinSet<()>,
}

impl BatchDispatcher {
    pub fn new(context: BatchContext) -> Self {
        Self {
            context,
            units: HashMap::new(),
            closed: HashSet::new(),
            dest_names: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn head(
        &mut self,
        batch_id: &str,
        table_name: &str,
        dest_table_name: &str,
        chunk_count: usize,
    ) -> Result<(), FlockError> {
        if batch_id.is_empty() {
            return Err(FlockError::protocol("batch head without a batch id"));
        }
        if self.units.contains_key(batch_id) || self.closed.contains(batch_id) {
            return Err(FlockError::protocol(format!(
                "batch '{}' was already started",
                batch_id
            )));
        }
        if chunk_count == 0 {
            return Err(FlockError::protocol(format!(
                "batch '{}' declares no chunks",
                batch_id
            )));
        }
        let table = self.context.tables.get(table_name).cloned().ok_or_else(|| {
            FlockError::protocol(format!(
                "batch '{}' targets unknown table '{}'",
                batch_id, table_name
            ))
        })?;

        let dest_table_name = dest_table_name.trim().to_string();
        let used_name = if dest_table_name.is_empty() {
            table.name.clone()
        } else {
            dest_table_name.clone()
        };
        // Verification counts one destination per table.
        match self.dest_names.get(&table.name) {
            Some(known) if *known != used_name => {
                return Err(FlockError::protocol(format!(
                    "batch '{}' writes '{}' to '{}' but earlier batches used '{}'",
                    batch_id, table.name, used_name, known
                )));
            }
            Some(_) => {}
            None => {
                self.dest_names.insert(table.name.clone(), used_name);
            }
        }

        self.reap_finished()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let job = BatchJob {
            batch_id: batch_id.to_string(),
            table,
            dest_table_name,
            expected: chunk_count,
        };
        self.tasks
            .spawn(run_batch(self.context.clone(), job, receiver));
        self.units.insert(
            batch_id.to_string(),
            BatchUnit {
                sender: Some(sender),
                expected: chunk_count,
                received: HashSet::with_capacity(chunk_count),
            },
        );

        log::debug!(
            "Batch '{}' opened for '{}' with {} chunk(s)",
            batch_id,
            table_name,
            chunk_count
        );
        Ok(())
    }

    pub fn chunk(&mut self, batch_id: &str, index: usize, payload: Vec<u8>) -> Result<(), FlockError> {
        let closed = self.closed.contains(batch_id);
        let unit = self.units.get_mut(batch_id).ok_or_else(|| {
            if closed {
                FlockError::protocol(format!("chunk for closed batch '{}'", batch_id))
            } else {
                FlockError::protocol(format!("chunk for unknown batch '{}'", batch_id))
            }
        })?;

        if unit.is_complete() {
            return Err(FlockError::protocol(format!(
                "chunk {} arrived after batch '{}' was complete",
                index, batch_id
            )));
        }
        if index >= unit.expected {
            return Err(FlockError::protocol(format!(
                "chunk index {} out of range for batch '{}' with {} chunk(s)",
                index, batch_id, unit.expected
            )));
        }
        if !unit.received.insert(index) {
            return Err(FlockError::protocol(format!(
                "duplicate chunk {} for batch '{}'",
                index, batch_id
            )));
        }

        if let Some(sender) = &unit.sender {
            // A closed receiver means the task already gave up; the session
            // learns why through the first-error slot.
            let _ = sender.send((index, payload));
        }
        if unit.is_complete() {
            unit.sender = None;
        }
        Ok(())
    }

    pub fn tail(&mut self, batch_id: &str) -> Result<(), FlockError> {
        let unit = self.units.get(batch_id).ok_or_else(|| {
            FlockError::protocol(format!("tail for unknown batch '{}'", batch_id))
        })?;
        if !unit.is_complete() {
            return Err(FlockError::protocol(format!(
                "tail for batch '{}' after {} of {} chunk(s)",
                batch_id,
                unit.received.len(),
                unit.expected
            )));
        }
        self.units.remove(batch_id);
        self.closed.insert(batch_id.to_string());
        Ok(())
    }

    /// Drops finished batch tasks without waiting on running ones.
    fn reap_finished(&mut self) -> Result<(), FlockError> {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                return Err(FlockError::Persistence(format!("Batch task failed: {}", e)));
            }
        }
        Ok(())
    }

    /// Spawned batch tasks not yet reaped.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Batches whose tail has not been seen yet.
    pub fn open_units(&self) -> usize {
        self.units.len()
    }

    /// Destination table name used per schema table.
    pub fn dest_names(&self) -> &HashMap<String, String> {
        &self.dest_names
    }

    /// Waits for every spawned batch task to finish.
    pub async fn drain(&mut self) -> Result<(), FlockError> {
        let mut panicked = None;
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if panicked.is_none() {
                    panicked = Some(FlockError::Persistence(format!("Batch task failed: {}", e)));
                }
            }
        }
        match panicked {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Stops feeding open batches and lets in-flight work settle.
    pub async fn shutdown(&mut self) {
        self.units.clear();
        while self.tasks.join_next().await.is_some() {}
    }
}
