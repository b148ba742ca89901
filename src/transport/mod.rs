// =====================================================
// TRANSPORT
// Line-delimited JSON frames over TCP
// =====================================================

use crate::error::FlockError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::FlockServer;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const OUTBOUND_CAPACITY: usize = 64;

/// Inbound half of a session's duplex channel.
#[async_trait]
pub trait MessageSource: Send {
    /// `Ok(None)` means the peer closed the stream.
    async fn recv(&mut self) -> Result<Option<ClientMessage>, FlockError>;
}

#[async_trait]
impl MessageSource for mpsc::Receiver<ClientMessage> {
    async fn recv(&mut self) -> Result<Option<ClientMessage>, FlockError> {
        Ok(mpsc::Receiver::recv(self).await)
    }
}

// --- Framing ---

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), String>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let mut line = serde_json::to_vec(message).map_err(|e| format!("Failed to encode frame: {}", e))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| format!("Failed to write frame: {}", e))?;
    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush frame: {}", e))
}

/// Reads the next non-empty line; `Ok(None)` at end of stream.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, String>
where
    R: AsyncBufRead + Unpin + Send,
{
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("Failed to read frame: {}", e))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, String> {
    serde_json::from_str::<T>(line.trim()).map_err(|e| format!("Failed to decode frame: {}", e))
}

/// Client messages read from a line-framed stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> MessageSource for FrameReader<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<ClientMessage>, FlockError> {
        let Some(line) = read_line(&mut self.reader).await.map_err(FlockError::Transport)? else {
            return Ok(None);
        };
        let message = decode_frame::<ClientMessage>(&line).map_err(FlockError::Protocol)?;
        if message == ClientMessage::Unknown {
            log::warn!("Unknown message received: {}", line.trim());
        }
        Ok(Some(message))
    }
}

/// Forwards outbound messages to the writer until every sender is gone.
pub fn spawn_writer<W>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<ServerMessage>,
) -> tokio::task::JoinHandle<Result<(), String>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            write_frame(&mut writer, &message).await?;
        }
        writer
            .shutdown()
            .await
            .map_err(|e| format!("Failed to close connection: {}", e))
    })
}

// --- Server ---

pub async fn handle_connection(server: Arc<FlockServer>, stream: TcpStream) -> Result<(), FlockError> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = spawn_writer(write_half, outbound_rx);

    let mut source = FrameReader::new(BufReader::new(read_half));
    let result = server.run_session(&mut source, outbound.clone()).await;

    if let Err(error) = &result {
        log::error!("Session from {} failed: {}", peer, error);
        let _ = outbound
            .send(ServerMessage::Failed {
                message: error.to_string(),
            })
            .await;
    }
    drop(outbound);

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Connection to {} closed uncleanly: {}", peer, e),
        Err(e) => log::warn!("Writer for {} stopped: {}", peer, e),
    }
    result.map(|_| ())
}

pub async fn serve(listener: TcpListener, server: Arc<FlockServer>) -> Result<(), String> {
    let local = listener
        .local_addr()
        .map_err(|e| format!("Failed to read listen address: {}", e))?;
    log::info!("Listening on {}", local);

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| format!("Failed to accept connection: {}", e))?;
        log::info!("Accepted connection from {}", peer);
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = handle_connection(server, stream).await;
        });
    }
}

pub async fn bind_and_serve(addr: &str, server: Arc<FlockServer>) -> Result<(), String> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    serve(listener, server).await
}
