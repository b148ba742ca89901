use thiserror::Error;

/// Failure kinds that end a streaming session.
///
/// Verification discrepancies are not listed here; they are reported as
/// data once the commit has already succeeded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlockError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Transformation error in table '{table}' column '{column}': {message}")]
    Transformation {
        table: String,
        column: String,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Verification query failed: {0}")]
    VerificationQuery(String),
}

impl FlockError {
    pub fn protocol(message: impl Into<String>) -> Self {
        FlockError::Protocol(message.into())
    }

    pub fn version_mismatch(received: &str) -> Self {
        FlockError::Protocol(format!(
            "must be version mismatch, unknown message type received: {}",
            received
        ))
    }

    /// Whether the destination may already hold committed data.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, FlockError::VerificationQuery(_))
    }
}

pub type Result<T> = std::result::Result<T, FlockError>;
