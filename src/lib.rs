// Streaming bulk loader: a client reads source tables and streams them in
// chunked batches; the server transforms each row and loads it into the
// destination inside one transaction per session.

pub mod client;
pub mod config;
pub mod db_types;
pub mod destination;
pub mod error;
pub mod functions;
pub mod identity;
pub mod ingest;
pub mod insert;
pub mod pipeline;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transport;
pub mod verification;

use crate::client::{run_transfer, SourcePool, SqlSource, TcpChannel, TransferSummary};
use crate::config::{ClientArgs, ServerArgs};
use crate::db_types::ConnectionConfig;
use crate::identity::IdentityStore;
use crate::insert::RowLimit;
use crate::schema::SchemaDefinition;
use crate::session::FlockServer;
use std::io::IsTerminal;
use std::sync::Arc;

/// Installs the process-wide subscriber; `log` records are forwarded to it.
pub fn init_logging() {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();
}

pub async fn run_server(args: ServerArgs) -> Result<(), String> {
    let row_limit = Arc::new(RowLimit::new(args.row_limit)?);
    let mut server = FlockServer::with_builtins()?.with_row_limit(row_limit);

    if let Some(url) = &args.identity_store {
        let store = IdentityStore::open(url).await?;
        server = server.with_identity_store(store);
        let restored = server.restore_identities().await?;
        log::info!("Restored {} identity mapping(s) from {}", restored, url);
    }

    transport::bind_and_serve(&args.listen, Arc::new(server)).await
}

pub async fn run_client(args: ClientArgs) -> Result<TransferSummary, String> {
    let schema_bytes = tokio::fs::read(&args.schema)
        .await
        .map_err(|e| format!("Failed to read schema {}: {}", args.schema.display(), e))?;
    let schema = SchemaDefinition::from_bytes(&schema_bytes)?;
    let plugin = match &args.plugin {
        Some(path) => tokio::fs::read(path)
            .await
            .map_err(|e| format!("Failed to read plugin {}: {}", path.display(), e))?,
        None => Vec::new(),
    };
    let options = args.transfer_options()?;

    let source_config = ConnectionConfig::from_driver(&args.source_driver, &args.source_url)?;
    let source = SqlSource::new(SourcePool::connect(&source_config).await?, args.query_params());

    let mut channel = TcpChannel::connect(&args.server).await?;
    run_transfer(&mut channel, &source, &schema, plugin, &options).await
}
