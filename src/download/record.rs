//!
//! # 记录模块
//! Transfer and chunk records, the units the manager persists and reports
//!

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::download::chunk_range::ChunkRange;
use crate::download::error::TransferError;
use crate::download::status::{ChunkStatus, TransferStatus};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Transfer {
    pub id: Uuid,
    pub url: Url,
    /// Library-relative destination
    pub destination: String,
    pub status: TransferStatus,
    /// The state a paused transfer resumes into
    pub paused_from: Option<TransferStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_size: Option<u64>,
    pub bytes_transferred: u64,
    pub content_type: Option<String>,
    pub accepts_ranges: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub file_id: Option<Uuid>,
    pub chunks: Vec<Chunk>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Chunk {
    pub index: usize,
    pub transfer_id: Uuid,
    /// `None` for the single open-ended stream of a resource without a known length
    pub range: Option<ChunkRange>,
    pub status: ChunkStatus,
    pub bytes_downloaded: u64,
    pub error: Option<String>,
}

impl Transfer {
    pub fn new(url: Url, destination: String) -> Self {
        let now = Utc::now();
        Self {
            url,
            destination,
            id: Uuid::new_v4(),
            status: TransferStatus::Pending,
            paused_from: None,
            created_at: now,
            updated_at: now,
            total_size: None,
            bytes_transferred: 0,
            content_type: None,
            accepts_ranges: false,
            error: None,
            retry_count: 0,
            file_id: None,
            chunks: Vec::new(),
        }
    }

    /// Move along the status graph, rejecting anything the graph does not list
    pub fn transition(&mut self, to: TransferStatus) -> Result<(), TransferError> {
        let from = self.status;
        let allowed = match from {
            TransferStatus::Paused if to.is_pausable() => self.paused_from == Some(to),
            _ => from.can_transition(to),
        };

        if !allowed {
            return Err(TransferError::InvalidTransition { from, to });
        }

        match to {
            TransferStatus::Paused => self.paused_from = Some(from),
            _ => self.paused_from = None,
        }
        self.status = to;
        self.updated_at = Utc::now();

        Ok(())
    }

    /// Terminal failure with the reason kept for status queries
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransferError> {
        self.transition(TransferStatus::Failed)?;
        self.error = Some(reason.into());

        Ok(())
    }

    pub fn chunk(&self, index: usize) -> Result<&Chunk, TransferError> {
        self.chunks
            .iter()
            .find(|chunk| chunk.index == index)
            .ok_or(TransferError::ChunkNotFound { transfer: self.id, index })
    }

    pub fn chunk_mut(&mut self, index: usize) -> Result<&mut Chunk, TransferError> {
        let transfer = self.id;
        self.chunks
            .iter_mut()
            .find(|chunk| chunk.index == index)
            .ok_or(TransferError::ChunkNotFound { transfer, index })
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.status == ChunkStatus::Completed)
    }

    pub fn refresh_bytes_transferred(&mut self) {
        self.bytes_transferred = self.chunks.iter().map(|chunk| chunk.bytes_downloaded).sum();
        self.updated_at = Utc::now();
    }

    /// Part file name of one chunk, relative to the local work backend
    pub fn part_path(&self, index: usize) -> String {
        format!("{}/{}.part", self.parts_dir(), index)
    }

    pub fn parts_dir(&self) -> String {
        format!("parts/{}", self.id)
    }
}

impl Chunk {
    pub fn new(transfer_id: Uuid, index: usize, range: Option<ChunkRange>) -> Self {
        Self {
            index,
            transfer_id,
            range,
            status: ChunkStatus::Pending,
            bytes_downloaded: 0,
            error: None,
        }
    }

    pub fn transition(&mut self, to: ChunkStatus) -> Result<(), TransferError> {
        if !self.status.can_transition(to) {
            return Err(TransferError::InvalidChunkTransition { from: self.status, to });
        }
        self.status = to;

        Ok(())
    }

    pub fn expected_len(&self) -> Option<u64> {
        self.range.map(|range| range.len())
    }

    pub fn is_full(&self) -> bool {
        self.expected_len() == Some(self.bytes_downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransferStatus::*;

    fn transfer_in(status: TransferStatus, paused_from: Option<TransferStatus>) -> Transfer {
        let mut transfer = Transfer::new(Url::parse("http://localhost/a.mp4").unwrap(), "a.mp4".into());
        transfer.status = status;
        transfer.paused_from = paused_from;
        transfer
    }

    fn listed(from: TransferStatus, to: TransferStatus, paused_from: Option<TransferStatus>) -> bool {
        let forward = [
            (Pending, Queued),
            (Queued, Preparing),
            (Preparing, Downloading),
            (Downloading, Assembling),
            (Assembling, Previewing),
            (Previewing, Completed),
        ];
        if forward.contains(&(from, to)) {
            return true;
        }
        if to == Paused {
            return matches!(from, Queued | Preparing | Downloading | Assembling | Previewing);
        }
        if from == Paused && paused_from == Some(to) {
            return true;
        }

        matches!(to, Failed | Canceled) && !matches!(from, Completed | Failed | Canceled)
    }

    #[test]
    fn should_follow_transition_table_exactly() {
        let mut paused_sources = vec![None];
        paused_sources.extend([Queued, Preparing, Downloading, Assembling, Previewing].map(Some));

        for from in TransferStatus::ALL {
            let sources = if from == Paused { paused_sources.clone() } else { vec![None] };
            for paused_from in sources {
                for to in TransferStatus::ALL {
                    let mut transfer = transfer_in(from, paused_from);
                    let result = transfer.transition(to);
                    if listed(from, to, paused_from) {
                        assert!(result.is_ok(), "{from} -> {to} should be accepted");
                        assert_eq!(transfer.status, to);
                    } else {
                        match result {
                            Err(TransferError::InvalidTransition { from: f, to: t }) => {
                                assert_eq!((f, t), (from, to));
                            }
                            other => panic!("{from} -> {to} should be rejected, got {other:?}"),
                        }
                        assert_eq!(transfer.status, from);
                    }
                }
            }
        }
    }

    #[test]
    fn should_resume_into_paused_state() {
        let mut transfer = transfer_in(Downloading, None);
        transfer.transition(Paused).unwrap();
        assert_eq!(transfer.paused_from, Some(Downloading));

        assert!(transfer.transition(Assembling).is_err());
        transfer.transition(Downloading).unwrap();
        assert_eq!(transfer.paused_from, None);
    }

    #[test]
    fn failure_records_reason() {
        let mut transfer = transfer_in(Downloading, None);
        transfer.fail("connection reset").unwrap();

        assert_eq!(transfer.status, Failed);
        assert_eq!(transfer.error.as_deref(), Some("connection reset"));
        assert!(transfer.fail("again").is_err());
        assert_eq!(transfer.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn error_names_both_states() {
        let mut transfer = transfer_in(Completed, None);
        let err = transfer.transition(Downloading).unwrap_err();

        assert_eq!(err.to_string(), "Invalid transition: completed -> downloading");
    }
}
