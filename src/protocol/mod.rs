// =====================================================
// WIRE PROTOCOL
// Client and server messages plus the row payload codec
// =====================================================

use crate::db_types::{IncomingRow, PlaceholderStyle, RowValue};
use crate::verification::CountMismatch;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Start {
        url: String,
        database: String,
        #[serde(default)]
        placeholder_style: PlaceholderStyle,
        #[serde(with = "base64_bytes", default)]
        schema: Vec<u8>,
        #[serde(with = "base64_bytes", default)]
        plugin: Vec<u8>,
    },
    Ping,
    #[serde(rename_all = "camelCase")]
    BatchHead {
        batch_id: String,
        table_name: String,
        #[serde(default)]
        dest_table_name: String,
        chunk_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    BatchChunk {
        batch_id: String,
        index: usize,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    BatchTail { batch_id: String },
    #[serde(rename_all = "camelCase")]
    End {
        #[serde(default)]
        record_counts: HashMap<String, i64>,
    },
    /// Any tag this build does not know.
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. } => "start",
            ClientMessage::Ping => "ping",
            ClientMessage::BatchHead { .. } => "batchHead",
            ClientMessage::BatchChunk { .. } => "batchChunk",
            ClientMessage::BatchTail { .. } => "batchTail",
            ClientMessage::End { .. } => "end",
            ClientMessage::Unknown => "unknown",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Pong,
    #[serde(rename_all = "camelCase")]
    BatchInsertResult { batch_id: String, success: bool },
    #[serde(rename_all = "camelCase")]
    SessionComplete {
        success: bool,
        discrepancies: Vec<CountMismatch>,
    },
    #[serde(rename_all = "camelCase")]
    Failed { message: String },
}

// --- Row payloads ---

pub fn encode_rows(rows: &[IncomingRow]) -> Result<Vec<u8>, String> {
    // JSON has no NaN or infinity; serde_json would write them as null and
    // the payload could not be decoded again.
    for (position, row) in rows.iter().enumerate() {
        let mut fields: Vec<_> = row.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, value) in fields {
            if let RowValue::Float(number) = value {
                if !number.is_finite() {
                    return Err(format!(
                        "Failed to encode rows: row {} field '{}' holds non-finite float {}",
                        position, field, number
                    ));
                }
            }
        }
    }
    serde_json::to_vec(rows).map_err(|e| format!("Failed to encode rows: {}", e))
}

/// An empty payload decodes to no rows.
pub fn decode_rows(payload: &[u8]) -> Result<Vec<IncomingRow>, String> {
    if payload.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice::<Vec<IncomingRow>>(payload)
        .map_err(|e| format!("Failed to decode rows: {}", e))
}

/// Splits an encoded payload into chunks of at most `max_chunk` bytes.
pub fn split_payload(payload: &[u8], max_chunk: usize) -> Result<Vec<Vec<u8>>, String> {
    if max_chunk == 0 {
        return Err("Chunk size must be greater than 0".to_string());
    }
    Ok(payload.chunks(max_chunk).map(|chunk| chunk.to_vec()).collect())
}
