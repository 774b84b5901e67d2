use thiserror::Error;
use tokio::io;
use uuid::Uuid;

use crate::download::status::{ChunkStatus, TransferStatus};

/// Errors raised by the transfer pipeline
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("Invalid chunk transition: {from} -> {to}")]
    InvalidChunkTransition {
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("Http request failed: {:?}", .0)]
    HttpRequestFailed(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Assembled size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Chunk {index} overflow: {attempted} bytes exceeds range of {len}")]
    ChunkOverflow { index: usize, attempted: u64, len: u64 },

    #[error("Invalid source url: {0}")]
    InvalidUrl(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Destination already exists: {0}")]
    DestinationExists(String),

    #[error("Transfer not found: {0}")]
    NotFound(Uuid),

    #[error("Chunk {index} of transfer {transfer} not found")]
    ChunkNotFound { transfer: Uuid, index: usize },

    #[error("IOError: {:?}", .0)]
    IOError(#[from] io::Error),
}

impl TransferError {
    /// Network failures are retried by the owning chunk worker, everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::HttpRequestFailed(_) | TransferError::Network(_))
    }
}

/// Why a chunk worker stopped before its range was complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadEndCause {
    Canceled,
    Paused,
}
