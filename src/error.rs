//! Crate-level error type

/// Error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("node identifier could not be parsed: {0}")]
    BadNodeId(String),

    #[error("namespace uri not present in server namespace table: {0}")]
    UnknownNamespace(String),

    #[error("no session for endpoint: {0}")]
    SessionNotFound(String),

    #[error("telemetry queue is full")]
    QueueFull,

    #[error("encoded record exceeds hub message size budget")]
    RecordTooLarge,

    #[error("continuation token version mismatch: requested {requested}, current {current}")]
    VersionMismatch { requested: u64, current: u64 },

    #[error("invalid continuation token")]
    BadContinuationToken,

    #[error("configuration file parse failure: {0}")]
    ConfigParse(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
