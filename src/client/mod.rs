// =====================================================
// TRANSFER CLIENT
// Reads source tables and streams them as chunked batches
// =====================================================

mod params;
mod source;

pub use params::{bind_named_parameters, extract_parameters, parse_key_value, parse_param_value};
pub use source::{RowSource, SourcePool, SqlSource};

use crate::db_types::{IncomingRow, PlaceholderStyle};
use crate::protocol::{encode_rows, split_payload, ClientMessage, ServerMessage};
use crate::schema::SchemaDefinition;
use crate::transport::{decode_frame, read_line, write_frame};
use crate::verification::CountMismatch;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const DEFAULT_BATCH_ROWS: usize = 100;
pub const DEFAULT_CHUNK_BYTES: usize = 60_000;

/// Client half of the duplex channel to a server.
#[async_trait]
pub trait ServerChannel: Send {
    async fn send(&mut self, message: ClientMessage) -> Result<(), String>;
    async fn recv(&mut self) -> Result<Option<ServerMessage>, String>;
}

pub struct TcpChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpChannel {
    pub async fn connect(addr: &str) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect to {}: {}", addr, e))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }
}

#[async_trait]
impl ServerChannel for TcpChannel {
    async fn send(&mut self, message: ClientMessage) -> Result<(), String> {
        write_frame(&mut self.writer, &message).await
    }

    async fn recv(&mut self) -> Result<Option<ServerMessage>, String> {
        match read_line(&mut self.reader).await? {
            Some(line) => decode_frame::<ServerMessage>(&line).map(Some),
            None => Ok(None),
        }
    }
}

/// Destination and sizing for one transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub dest_url: String,
    pub dest_database: String,
    pub placeholder_style: PlaceholderStyle,
    pub batch_rows: usize,
    pub chunk_bytes: usize,
    /// Destination table per schema table, when it differs.
    pub dest_tables: HashMap<String, String>,
}

impl TransferOptions {
    pub fn new(dest_database: &str, dest_url: &str, placeholder_style: PlaceholderStyle) -> Self {
        Self {
            dest_url: dest_url.to_string(),
            dest_database: dest_database.to_string(),
            placeholder_style,
            batch_rows: DEFAULT_BATCH_ROWS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            dest_tables: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSummary {
    pub record_counts: HashMap<String, i64>,
    pub batches: usize,
    pub discrepancies: Vec<CountMismatch>,
}

async fn expect_reply<C>(channel: &mut C, waiting_for: &str) -> Result<ServerMessage, String>
where
    C: ServerChannel + ?Sized,
{
    match channel.recv().await? {
        Some(ServerMessage::Failed { message }) => Err(format!("Server failed: {}", message)),
        Some(message) => Ok(message),
        None => Err(format!("Server closed the connection while waiting for {}", waiting_for)),
    }
}

/// Checks that the server answers within an open session.
pub async fn ping<C>(channel: &mut C) -> Result<(), String>
where
    C: ServerChannel + ?Sized,
{
    channel.send(ClientMessage::Ping).await?;
    match expect_reply(channel, "pong").await? {
        ServerMessage::Pong => Ok(()),
        other => Err(format!("Expected pong, got {:?}", other)),
    }
}

async fn send_batch<C>(
    channel: &mut C,
    table: &str,
    dest_table: &str,
    rows: &[IncomingRow],
    chunk_bytes: usize,
) -> Result<(), String>
where
    C: ServerChannel + ?Sized,
{
    let payload = encode_rows(rows)?;
    let chunks = split_payload(&payload, chunk_bytes)?;
    let batch_id = uuid::Uuid::new_v4().to_string();

    channel
        .send(ClientMessage::BatchHead {
            batch_id: batch_id.clone(),
            table_name: table.to_string(),
            dest_table_name: dest_table.to_string(),
            chunk_count: chunks.len(),
        })
        .await?;
    for (index, payload) in chunks.into_iter().enumerate() {
        channel
            .send(ClientMessage::BatchChunk {
                batch_id: batch_id.clone(),
                index,
                payload,
            })
            .await?;
    }
    channel
        .send(ClientMessage::BatchTail {
            batch_id: batch_id.clone(),
        })
        .await?;

    match expect_reply(channel, "batch result").await? {
        ServerMessage::BatchInsertResult {
            batch_id: acknowledged,
            success: true,
        } if acknowledged == batch_id => Ok(()),
        other => Err(format!("Unexpected reply to batch '{}': {:?}", batch_id, other)),
    }
}

/// Streams every schema entry from `source` and closes the session.
pub async fn run_transfer<C>(
    channel: &mut C,
    source: &dyn RowSource,
    schema: &SchemaDefinition,
    plugin: Vec<u8>,
    options: &TransferOptions,
) -> Result<TransferSummary, String>
where
    C: ServerChannel + ?Sized,
{
    if options.batch_rows == 0 {
        return Err("Batch size must be greater than 0".to_string());
    }

    channel
        .send(ClientMessage::Start {
            url: options.dest_url.clone(),
            database: options.dest_database.clone(),
            placeholder_style: options.placeholder_style,
            schema: schema.to_bytes()?,
            plugin,
        })
        .await?;
    match expect_reply(channel, "session start").await? {
        ServerMessage::Pong => {}
        other => return Err(format!("Unexpected reply to start: {:?}", other)),
    }

    let mut summary = TransferSummary::default();
    for entry in &schema.entries {
        let rows = source.fetch(entry).await?;
        let dest_table = options
            .dest_tables
            .get(&entry.name)
            .map(String::as_str)
            .unwrap_or("");

        for batch in rows.chunks(options.batch_rows) {
            send_batch(channel, &entry.name, dest_table, batch, options.chunk_bytes).await?;
            summary.batches += 1;
        }
        summary
            .record_counts
            .insert(entry.name.clone(), rows.len() as i64);
        ping(channel).await?;
        log::info!("Sent {} row(s) of '{}'", rows.len(), entry.name);
    }

    channel
        .send(ClientMessage::End {
            record_counts: summary.record_counts.clone(),
        })
        .await?;
    match expect_reply(channel, "session completion").await? {
        ServerMessage::SessionComplete {
            success: true,
            discrepancies,
        } => {
            for mismatch in &discrepancies {
                log::warn!(
                    "'{}': sent {} row(s), destination has {}",
                    mismatch.table,
                    mismatch.expected,
                    mismatch.found
                );
            }
            summary.discrepancies = discrepancies;
            Ok(summary)
        }
        other => Err(format!("Unexpected reply to end: {:?}", other)),
    }
}
