//!
//! # 状态机模块
//! Transfer and chunk status vocabularies with their legal transitions
//!

use std::fmt;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Queued,
    Preparing,
    Downloading,
    Assembling,
    Previewing,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 10] = [
        TransferStatus::Pending,
        TransferStatus::Queued,
        TransferStatus::Preparing,
        TransferStatus::Downloading,
        TransferStatus::Assembling,
        TransferStatus::Previewing,
        TransferStatus::Paused,
        TransferStatus::Completed,
        TransferStatus::Failed,
        TransferStatus::Canceled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled)
    }

    /// States a running transfer can be paused from
    pub fn is_pausable(self) -> bool {
        matches!(
            self,
            TransferStatus::Queued
                | TransferStatus::Preparing
                | TransferStatus::Downloading
                | TransferStatus::Assembling
                | TransferStatus::Previewing
        )
    }

    /// Edge check on the status graph alone.
    ///
    /// `Paused -> x` is accepted for every pausable `x`; the transfer record narrows it
    /// to the state it was actually paused from.
    pub fn can_transition(self, to: TransferStatus) -> bool {
        use TransferStatus::*;

        match (self, to) {
            (Pending, Queued)
            | (Queued, Preparing)
            | (Preparing, Downloading)
            | (Downloading, Assembling)
            | (Assembling, Previewing)
            | (Previewing, Completed) => true,
            (from, Failed | Canceled) => !from.is_terminal(),
            (from, Paused) => from.is_pausable(),
            (Paused, to) => to.is_pausable(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Queued => "queued",
            TransferStatus::Preparing => "preparing",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Assembling => "assembling",
            TransferStatus::Previewing => "previewing",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Canceled,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Canceled)
    }

    pub fn can_transition(self, to: ChunkStatus) -> bool {
        use ChunkStatus::*;

        matches!(
            (self, to),
            (Pending, Downloading)
                | (Pending, Canceled)
                // pause hands the chunk back to the queue with its progress
                | (Downloading, Pending)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Canceled)
                | (Failed, Pending)
                | (Failed, Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Downloading => "downloading",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
