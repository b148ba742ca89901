// =====================================================
// STREAMING SESSION
// Per-connection protocol state machine
// =====================================================

use crate::db_types::{ConnectionConfig, PlaceholderStyle};
use crate::destination::{connect_destination, Destination, SharedTransaction};
use crate::error::FlockError;
use crate::functions::{FunctionRegistry, NoPlugins, PluginLoader};
use crate::identity::{IdentityCache, IdentityStore};
use crate::ingest::{BatchContext, BatchDispatcher, FirstError};
use crate::insert::{InsertDialect, RowLimit};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::schema::{build_tables, SchemaDefinition};
use crate::transport::MessageSource;
use crate::verification::{verify_counts, VerificationReport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Ready,
    Ending,
    Closed,
}

/// Opens destinations named by a `Start` message.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Destination>, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlxConnector;

#[async_trait]
impl DestinationConnector for SqlxConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Destination>, String> {
        connect_destination(config).await
    }
}

struct StartRequest {
    url: String,
    database: String,
    placeholder_style: PlaceholderStyle,
    schema: Vec<u8>,
    plugin: Vec<u8>,
}

/// State owned by one connection between `Start` and `End`.
struct StreamSession {
    state: SessionState,
    destination: Arc<dyn Destination>,
    transaction: SharedTransaction,
    dispatcher: BatchDispatcher,
    first_error: FirstError,
    outbound: mpsc::Sender<ServerMessage>,
}

impl StreamSession {
    fn transition(&mut self, next: SessionState) {
        log::debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn send(&self, message: ServerMessage) -> Result<(), FlockError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| FlockError::Transport("client is no longer receiving".to_string()))
    }

    /// Processes messages until `End`, returning the client's row counts
    /// once the transaction has been committed.
    async fn receive<S>(&mut self, source: &mut S) -> Result<HashMap<String, i64>, FlockError>
    where
        S: MessageSource + ?Sized,
    {
        loop {
            let received = tokio::select! {
                biased;
                error = self.first_error.wait() => return Err(error),
                received = source.recv() => received?,
            };
            if let Some(error) = self.first_error.get() {
                return Err(error);
            }
            let Some(message) = received else {
                return Err(FlockError::Transport(
                    "client disconnected before end of session".to_string(),
                ));
            };

            match message {
                ClientMessage::Ping => self.send(ServerMessage::Pong).await?,
                ClientMessage::BatchHead {
                    batch_id,
                    table_name,
                    dest_table_name,
                    chunk_count,
                } => self
                    .dispatcher
                    .head(&batch_id, &table_name, &dest_table_name, chunk_count)?,
                ClientMessage::BatchChunk {
                    batch_id,
                    index,
                    payload,
                } => self.dispatcher.chunk(&batch_id, index, payload)?,
                ClientMessage::BatchTail { batch_id } => self.dispatcher.tail(&batch_id)?,
                ClientMessage::End { record_counts } => {
                    self.finish().await?;
                    return Ok(record_counts);
                }
                ClientMessage::Start { .. } => {
                    return Err(FlockError::protocol("start received twice in one session"))
                }
                ClientMessage::Unknown => return Err(FlockError::version_mismatch("unknown")),
            }
        }
    }

    async fn finish(&mut self) -> Result<(), FlockError> {
        let open = self.dispatcher.open_units();
        if open > 0 {
            return Err(FlockError::protocol(format!(
                "end of session received with {} batch(es) still open",
                open
            )));
        }
        self.transition(SessionState::Ending);

        self.dispatcher.drain().await?;
        if let Some(error) = self.first_error.get() {
            return Err(error);
        }

        self.transaction
            .commit()
            .await
            .map_err(FlockError::Persistence)?;
        log::info!("Session transaction committed");
        Ok(())
    }

    async fn abort(&mut self, error: &FlockError) {
        self.first_error.record(error.clone());
        self.dispatcher.shutdown().await;
        if let Err(e) = self.transaction.rollback().await {
            log::error!("Rollback failed: {}", e);
        }
        self.transition(SessionState::Closed);
    }
}

// --- Server ---

/// Process-wide state shared by every session.
pub struct FlockServer {
    registry: Arc<FunctionRegistry>,
    identity: Arc<IdentityCache>,
    identity_store: Option<IdentityStore>,
    row_limit: Arc<RowLimit>,
    plugin_loader: Arc<dyn PluginLoader>,
    connector: Arc<dyn DestinationConnector>,
}

impl FlockServer {
    pub fn new(registry: Arc<FunctionRegistry>, identity: Arc<IdentityCache>) -> Self {
        Self {
            registry,
            identity,
            identity_store: None,
            row_limit: Arc::new(RowLimit::default()),
            plugin_loader: Arc::new(NoPlugins),
            connector: Arc::new(SqlxConnector),
        }
    }

    /// Server with a fresh identity cache and the built-in functions.
    pub fn with_builtins() -> Result<Self, String> {
        let identity = Arc::new(IdentityCache::new());
        let registry = Arc::new(FunctionRegistry::with_builtins(Arc::clone(&identity))?);
        Ok(Self::new(registry, identity))
    }

    pub fn with_row_limit(mut self, row_limit: Arc<RowLimit>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn with_identity_store(mut self, store: IdentityStore) -> Self {
        self.identity_store = Some(store);
        self
    }

    pub fn with_plugin_loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.plugin_loader = loader;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn DestinationConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<IdentityCache> {
        &self.identity
    }

    pub fn row_limit(&self) -> &Arc<RowLimit> {
        &self.row_limit
    }

    /// Loads persisted identities into the cache.
    pub async fn restore_identities(&self) -> Result<usize, String> {
        match &self.identity_store {
            Some(store) => store.restore(&self.identity).await,
            None => Ok(0),
        }
    }

    async fn start(
        &self,
        request: StartRequest,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<StreamSession, FlockError> {
        let config = ConnectionConfig::from_driver(&request.database, &request.url)
            .map_err(FlockError::Startup)?;
        if request.placeholder_style != config.db_type.default_placeholder_style() {
            log::warn!(
                "Placeholder style {:?} is unusual for {}",
                request.placeholder_style,
                config.db_type.as_str()
            );
        }

        let definition = SchemaDefinition::from_bytes(&request.schema).map_err(FlockError::Startup)?;
        let tables = build_tables(&definition).map_err(FlockError::Startup)?;

        let mut functions = self.registry.snapshot().map_err(FlockError::Startup)?;
        let plugins = self
            .plugin_loader
            .load(&request.plugin)
            .map_err(FlockError::Startup)?;
        functions.extend(plugins).map_err(FlockError::Startup)?;
        functions.check_tables(&tables).map_err(FlockError::Startup)?;

        let destination = self
            .connector
            .connect(&config)
            .await
            .map_err(FlockError::Startup)?;
        let transaction = SharedTransaction::new(destination.begin().await.map_err(FlockError::Startup)?);

        let first_error = FirstError::new();
        let context = BatchContext {
            transaction: transaction.clone(),
            tables: Arc::new(tables),
            functions: Arc::new(functions),
            dialect: InsertDialect::new(config.db_type, request.placeholder_style),
            row_limit: Arc::clone(&self.row_limit),
            outbound: outbound.clone(),
            first_error: first_error.clone(),
        };

        log::info!(
            "Session started against {} with {} table(s)",
            config.db_type.as_str(),
            context.tables.len()
        );

        Ok(StreamSession {
            state: SessionState::Ready,
            destination,
            transaction,
            dispatcher: BatchDispatcher::new(context),
            first_error,
            outbound,
        })
    }

    /// Runs one session to completion over `source`.
    ///
    /// Any error rolls the session's transaction back. Verification
    /// mismatches are returned in the report, not as errors.
    pub async fn run_session<S>(
        &self,
        source: &mut S,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<VerificationReport, FlockError>
    where
        S: MessageSource + ?Sized,
    {
        let request = match source.recv().await? {
            Some(ClientMessage::Start {
                url,
                database,
                placeholder_style,
                schema,
                plugin,
            }) => StartRequest {
                url,
                database,
                placeholder_style,
                schema,
                plugin,
            },
            Some(other) => {
                log::error!(
                    "Expected start in state {:?}, got {}",
                    SessionState::AwaitingStart,
                    other.kind()
                );
                return Err(FlockError::version_mismatch(other.kind()));
            }
            None => {
                return Err(FlockError::Transport(
                    "client disconnected before start".to_string(),
                ))
            }
        };

        let mut session = self.start(request, outbound).await?;
        let result = match session.send(ServerMessage::Pong).await {
            Ok(()) => self.complete(&mut session, source).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(report) => {
                session.transition(SessionState::Closed);
                Ok(report)
            }
            Err(error) => {
                session.abort(&error).await;
                Err(error)
            }
        }
    }

    async fn complete<S>(
        &self,
        session: &mut StreamSession,
        source: &mut S,
    ) -> Result<VerificationReport, FlockError>
    where
        S: MessageSource + ?Sized,
    {
        let record_counts = session.receive(source).await?;

        if let Some(store) = &self.identity_store {
            match store.persist(&self.identity).await {
                Ok(written) => log::debug!("Persisted {} new identity mapping(s)", written),
                Err(e) => log::error!("Identity mappings were not persisted: {}", e),
            }
        }

        let report = verify_counts(
            session.destination.as_ref(),
            &record_counts,
            session.dispatcher.dest_names(),
        )
        .await?;

        session
            .send(ServerMessage::SessionComplete {
                success: true,
                discrepancies: report.mismatches.clone(),
            })
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests;
