// =====================================================
// CONFIGURATION
// Command-line and environment settings for both binaries
// =====================================================

use crate::client::{parse_key_value, TransferOptions, DEFAULT_BATCH_ROWS, DEFAULT_CHUNK_BYTES};
use crate::db_types::{DatabaseType, PlaceholderStyle};
use crate::insert::DEFAULT_ROW_LIMIT;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:50051";
pub const DEFAULT_SERVER: &str = "127.0.0.1:50051";

/// Options for `flock-server`.
#[derive(Parser, Debug, Clone)]
#[command(name = "flock-server", about = "Receives streamed batches and loads them into a destination database")]
pub struct ServerArgs {
    #[arg(long, env = "FLOCK_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Maximum value tuples per INSERT statement.
    #[arg(long, env = "FLOCK_ROW_LIMIT", default_value_t = DEFAULT_ROW_LIMIT as i64, allow_negative_numbers = true)]
    pub row_limit: i64,

    /// SQLite url where identity mappings are kept between runs.
    #[arg(long, env = "FLOCK_IDENTITY_STORE")]
    pub identity_store: Option<String>,
}

/// Options for `flock-client`.
#[derive(Parser, Debug, Clone)]
#[command(name = "flock-client", about = "Streams source tables to a flock server")]
pub struct ClientArgs {
    #[arg(long, env = "FLOCK_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Schema document (JSON) describing destination tables.
    #[arg(long, short = 's', env = "FLOCK_SCHEMA")]
    pub schema: PathBuf,

    /// Plugin payload forwarded to the server as is.
    #[arg(long, env = "FLOCK_PLUGIN")]
    pub plugin: Option<PathBuf>,

    /// postgres, mysql or sqlite
    #[arg(long, env = "FLOCK_SOURCE_DRIVER")]
    pub source_driver: String,

    #[arg(long, env = "FLOCK_SOURCE_URL")]
    pub source_url: String,

    #[arg(long, env = "FLOCK_DEST_DRIVER")]
    pub dest_driver: String,

    #[arg(long, env = "FLOCK_DEST_URL")]
    pub dest_url: String,

    /// question or dollar; defaults to the destination driver's style.
    #[arg(long, env = "FLOCK_PLACEHOLDER_STYLE")]
    pub placeholder_style: Option<String>,

    /// Value for an `@name` reference in source queries, as name=value.
    #[arg(long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Destination table for a schema table, as table=destination.
    #[arg(long = "dest-table", value_parser = parse_key_value)]
    pub dest_tables: Vec<(String, String)>,

    #[arg(long, env = "FLOCK_BATCH_ROWS", default_value_t = DEFAULT_BATCH_ROWS)]
    pub batch_rows: usize,

    #[arg(long, env = "FLOCK_CHUNK_BYTES", default_value_t = DEFAULT_CHUNK_BYTES)]
    pub chunk_bytes: usize,
}

pub fn parse_placeholder_style(value: &str) -> Result<PlaceholderStyle, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "question" | "?" => Ok(PlaceholderStyle::Question),
        "dollar" | "$" => Ok(PlaceholderStyle::Dollar),
        other => Err(format!("Unknown placeholder style '{}'", other)),
    }
}

impl ClientArgs {
    pub fn transfer_options(&self) -> Result<TransferOptions, String> {
        let dest_type = DatabaseType::from_driver_name(&self.dest_driver)?;
        let placeholder_style = match &self.placeholder_style {
            Some(value) => parse_placeholder_style(value)?,
            None => dest_type.default_placeholder_style(),
        };
        if self.batch_rows == 0 {
            return Err("--batch-rows must be greater than 0".to_string());
        }
        if self.chunk_bytes == 0 {
            return Err("--chunk-bytes must be greater than 0".to_string());
        }

        let mut options = TransferOptions::new(&self.dest_driver, &self.dest_url, placeholder_style);
        options.batch_rows = self.batch_rows;
        options.chunk_bytes = self.chunk_bytes;
        options.dest_tables = self.dest_tables.iter().cloned().collect();
        Ok(options)
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        self.params.iter().cloned().collect()
    }
}
