//! Error types for the telemetry pipeline.
//!
//! Errors are split along the same lines as the data flow:
//!
//! - **`DecodeError`**: a packet could not be understood. Contained locally:
//!   the packet is logged and dropped, the ingest stream keeps going.
//! - **`StoreError`**: the sample journal could not be read or written. An
//!   append failure loses that one sample; a read or delete failure aborts
//!   the current sync attempt, which is retried on the next tick.
//! - **`TransportError`**: the ingest endpoint could not be reached or did
//!   not answer with a success status. Surfaces to the coordinator as
//!   `IngestOutcome::TransportFailure`, never as data loss.
//! - **`WearSyncError`**: the application-level error that wraps the above
//!   plus configuration and I/O problems via `#[from]`.

use crate::sample::SourceTag;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, WearSyncError>;

/// A payload matched none of the accepted wire shapes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot decode {payload_len}-byte packet from {peripheral}: {reason}")]
pub struct DecodeError {
    /// Why the last attempted shape rejected the payload.
    pub reason: String,
    /// Peripheral that sent it.
    pub peripheral: SourceTag,
    /// Length of the rejected payload in bytes.
    pub payload_len: usize,
}

/// Persistence failure in the sample journal.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("journal corrupt at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

/// Failure to complete an HTTP exchange with the ingest endpoint.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid ingest url '{0}'")]
    InvalidUrl(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request build error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("endpoint answered with status {0}")]
    Status(u16),
}

/// Application-level error.
#[derive(Error, Debug)]
pub enum WearSyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest queue closed")]
    QueueClosed,

    #[error("Ingest queue full, packet from {0} dropped")]
    QueueFull(SourceTag),

    #[error("Logging setup error: {0}")]
    Logging(String),
}
