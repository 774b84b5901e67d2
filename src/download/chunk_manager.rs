//!
//! # 分块协调模块
//! Plans chunk ranges and moves chunks through their lifecycle. Every method is a single
//! critical section on the owning transfer, including the "all chunks done" check.
//!

use std::num::NonZeroU64;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::download::chunk_range::{plan_chunks, ChunkRange};
use crate::download::error::{DownloadEndCause, TransferError};
use crate::download::record::{Chunk, Transfer};
use crate::download::source::RemoteMetadata;
use crate::download::status::{ChunkStatus, TransferStatus};
use crate::download::store::{TransferEntry, TransferStore};

/// Result of recording progress on a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Progress,
    ChunkCompleted,
    /// This call completed the last chunk and moved the transfer to `assembling`
    ReadyToAssemble,
    Interrupted(DownloadEndCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { attempt: u32 },
    TransferFailed,
    Interrupted(DownloadEndCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The transfer was resumed before the worker noticed the stop
    Requeue,
    Stopped(DownloadEndCause),
}

/// What a chunk worker needs once it owns a chunk
#[derive(Debug, Clone)]
pub struct ChunkClaim {
    pub transfer_id: Uuid,
    pub index: usize,
    pub url: Url,
    pub range: Option<ChunkRange>,
    /// Bytes already on disk for this chunk
    pub offset: u64,
    pub accepts_ranges: bool,
    pub part_path: String,
    pub stop_token: CancellationToken,
}

pub struct ChunkManager {
    store: TransferStore,
    chunk_size: NonZeroU64,
    max_retries: u32,
}

impl ChunkManager {
    pub fn new(store: TransferStore, chunk_size: NonZeroU64, max_retries: u32) -> Self {
        Self {
            store,
            chunk_size,
            max_retries,
        }
    }

    /// Lay out the chunk plan of a `preparing` transfer and move it to `downloading`.
    ///
    /// Ranged chunking needs a known length and byte-range support; anything else is
    /// fetched as one chunk, open-ended when the length is unknown.
    pub fn start(&self, id: Uuid, metadata: &RemoteMetadata) -> Result<Vec<Chunk>, TransferError> {
        let chunk_size = self.chunk_size;

        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if transfer.status != TransferStatus::Preparing {
                return Err(TransferError::InvalidTransition {
                    from: transfer.status,
                    to: TransferStatus::Downloading,
                });
            }

            let ranges: Vec<Option<ChunkRange>> = match metadata.content_length {
                Some(len) if metadata.accepts_ranges => {
                    plan_chunks(len, chunk_size).into_iter().map(Some).collect()
                }
                Some(0) => Vec::new(),
                Some(len) => vec![Some(ChunkRange::from_len(0, len))],
                None => vec![None],
            };

            transfer.total_size = metadata.content_length;
            transfer.accepts_ranges = metadata.accepts_ranges;
            transfer.content_type = metadata.content_type.clone();
            transfer.chunks = ranges
                .into_iter()
                .enumerate()
                .map(|(index, range)| Chunk::new(transfer.id, index, range))
                .collect();
            transfer.refresh_bytes_transferred();
            transfer.transition(TransferStatus::Downloading)?;

            info!(
                "Transfer {} planned {} chunk(s) for {:?} bytes",
                transfer.id,
                transfer.chunks.len(),
                transfer.total_size
            );

            Ok(transfer.chunks.clone())
        })
    }

    /// Hand a pending chunk to a worker. `None` when the chunk is not claimable right now.
    pub fn claim(&self, id: Uuid, index: usize) -> Result<Option<ChunkClaim>, TransferError> {
        self.store.with(id, |entry| {
            let stop_token = entry.stop_token.clone();
            let transfer = &mut entry.transfer;
            if transfer.status != TransferStatus::Downloading {
                return Ok(None);
            }

            let part_path = transfer.part_path(index);
            let (url, accepts_ranges) = (transfer.url.clone(), transfer.accepts_ranges);
            let chunk = transfer.chunk_mut(index)?;
            if chunk.status != ChunkStatus::Pending {
                return Ok(None);
            }
            chunk.transition(ChunkStatus::Downloading)?;

            Ok(Some(ChunkClaim {
                url,
                index,
                part_path,
                accepts_ranges,
                stop_token,
                transfer_id: id,
                range: chunk.range,
                offset: chunk.bytes_downloaded,
            }))
        })
    }

    /// Record `bytes_read` more bytes on a claimed chunk.
    ///
    /// A canceled or failed transfer accepts no writes. A paused one keeps the bytes
    /// already on disk and takes the chunk back to `pending`.
    pub fn advance(&self, id: Uuid, index: usize, bytes_read: u64) -> Result<AdvanceOutcome, TransferError> {
        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if let Some(cause) = stopped_cause(transfer.status) {
                return Ok(AdvanceOutcome::Interrupted(cause));
            }

            let paused = transfer.status == TransferStatus::Paused;
            let chunk = transfer.chunk_mut(index)?;
            let attempted = chunk.bytes_downloaded + bytes_read;
            if let Some(len) = chunk.expected_len() {
                if attempted > len {
                    return Err(TransferError::ChunkOverflow { index, attempted, len });
                }
            }
            chunk.bytes_downloaded = attempted;

            let outcome = if chunk.is_full() {
                chunk.transition(ChunkStatus::Completed)?;
                AdvanceOutcome::ChunkCompleted
            } else if paused {
                chunk.transition(ChunkStatus::Pending)?;
                AdvanceOutcome::Interrupted(DownloadEndCause::Paused)
            } else {
                AdvanceOutcome::Progress
            };
            transfer.refresh_bytes_transferred();

            if outcome == AdvanceOutcome::ChunkCompleted && begin_assembly(transfer)? {
                return Ok(AdvanceOutcome::ReadyToAssemble);
            }

            Ok(outcome)
        })
    }

    /// The open-ended stream of an unknown-length resource ended: its length is the total
    pub fn finish_stream(&self, id: Uuid, index: usize) -> Result<AdvanceOutcome, TransferError> {
        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if let Some(cause) = stopped_cause(transfer.status) {
                return Ok(AdvanceOutcome::Interrupted(cause));
            }

            let chunk = transfer.chunk_mut(index)?;
            let total = chunk.bytes_downloaded;
            chunk.transition(ChunkStatus::Completed)?;
            transfer.total_size = Some(total);
            transfer.refresh_bytes_transferred();

            if begin_assembly(transfer)? {
                return Ok(AdvanceOutcome::ReadyToAssemble);
            }

            Ok(AdvanceOutcome::ChunkCompleted)
        })
    }

    /// Move a `downloading` transfer whose chunks are all complete to `assembling`.
    /// Returns true only for the caller that made the move.
    pub fn try_begin_assembly(&self, id: Uuid) -> Result<bool, TransferError> {
        self.store.with(id, |entry| begin_assembly(&mut entry.transfer))
    }

    /// Record a failed fetch. Network errors count against the transfer's retry budget,
    /// anything else fails the transfer outright.
    pub fn fail(
        &self,
        id: Uuid,
        index: usize,
        error: &TransferError,
    ) -> Result<FailureOutcome, TransferError> {
        let max_retries = self.max_retries;

        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if let Some(cause) = stopped_cause(transfer.status) {
                return Ok(FailureOutcome::Interrupted(cause));
            }

            let chunk = transfer.chunk_mut(index)?;
            chunk.transition(ChunkStatus::Failed)?;
            chunk.error = Some(error.to_string());

            if error.is_retryable() {
                transfer.retry_count += 1;
                if transfer.retry_count <= max_retries {
                    warn!(
                        "Chunk {} of {} failed, retry {}/{}: {}",
                        index, id, transfer.retry_count, max_retries, error
                    );
                    return Ok(FailureOutcome::Retry { attempt: transfer.retry_count });
                }
            }

            fail_transfer(entry, error.to_string())?;
            Ok(FailureOutcome::TransferFailed)
        })
    }

    /// Put a failed chunk back in line. True when it should be dispatched now.
    pub fn requeue(&self, id: Uuid, index: usize) -> Result<bool, TransferError> {
        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if transfer.status.is_terminal() {
                return Ok(false);
            }

            let dispatch = transfer.status == TransferStatus::Downloading;
            let chunk = transfer.chunk_mut(index)?;
            if chunk.status != ChunkStatus::Failed {
                return Ok(false);
            }
            chunk.transition(ChunkStatus::Pending)?;

            Ok(dispatch)
        })
    }

    /// A worker was woken by the stop token; hand its chunk back unless the transfer is over
    pub fn interrupt(&self, id: Uuid, index: usize) -> Result<InterruptOutcome, TransferError> {
        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            if let Some(cause) = stopped_cause(transfer.status) {
                return Ok(InterruptOutcome::Stopped(cause));
            }

            let resumed = transfer.status == TransferStatus::Downloading;
            let chunk = transfer.chunk_mut(index)?;
            if chunk.status == ChunkStatus::Downloading {
                chunk.transition(ChunkStatus::Pending)?;
            }

            if resumed {
                Ok(InterruptOutcome::Requeue)
            } else {
                Ok(InterruptOutcome::Stopped(DownloadEndCause::Paused))
            }
        })
    }

    /// Align recorded progress with the part file actually on disk, which may be shorter
    /// after a crash. Also used to restart an open-ended stream from zero.
    pub fn rewind(&self, id: Uuid, index: usize, on_disk: u64) -> Result<u64, TransferError> {
        self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            let chunk = transfer.chunk_mut(index)?;
            if on_disk < chunk.bytes_downloaded {
                debug!(
                    "Rewinding chunk {} of {} from {} to {} bytes",
                    index, id, chunk.bytes_downloaded, on_disk
                );
                chunk.bytes_downloaded = on_disk;
            }
            let offset = chunk.bytes_downloaded;
            transfer.refresh_bytes_transferred();

            Ok(offset)
        })
    }
}

fn stopped_cause(status: TransferStatus) -> Option<DownloadEndCause> {
    match status {
        TransferStatus::Canceled | TransferStatus::Failed => Some(DownloadEndCause::Canceled),
        _ => None,
    }
}

fn begin_assembly(transfer: &mut Transfer) -> Result<bool, TransferError> {
    if transfer.status != TransferStatus::Downloading || !transfer.all_chunks_completed() {
        return Ok(false);
    }
    transfer.transition(TransferStatus::Assembling)?;

    Ok(true)
}

/// Fail the transfer, closing out every chunk that can no longer finish and waking
/// the workers still streaming its siblings
pub fn fail_transfer(entry: &mut TransferEntry, reason: String) -> Result<(), TransferError> {
    entry.transfer.fail(reason)?;
    settle_chunks(&mut entry.transfer);
    entry.stop_workers();

    Ok(())
}

/// Cancel every chunk that is still waiting or in flight
pub fn settle_chunks(transfer: &mut Transfer) {
    for chunk in transfer.chunks.iter_mut() {
        if matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Downloading) {
            chunk.status = ChunkStatus::Canceled;
        }
    }
}
