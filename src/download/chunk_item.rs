//!
//! # 分块下载模块
//! One worker owns one claimed chunk: it streams the missing bytes into the chunk's part
//! file and reports every piece to the coordinator before reading the next one
//!

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::select;

use crate::download::chunk_manager::{AdvanceOutcome, ChunkClaim, ChunkManager, InterruptOutcome};
use crate::download::error::{DownloadEndCause, TransferError};
use crate::download::source::{FetchSpan, RemoteSource};

/// How a chunk worker finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEnd {
    Completed { ready_to_assemble: bool },
    Stopped(DownloadEndCause),
    /// Woken by a stop that was already undone, the chunk is pending again
    Requeue,
}

pub struct ChunkItem {
    source: Arc<dyn RemoteSource>,
    chunk_manager: Arc<ChunkManager>,
    work_dir: PathBuf,
}

impl ChunkItem {
    pub fn new(source: Arc<dyn RemoteSource>, chunk_manager: Arc<ChunkManager>, work_dir: PathBuf) -> Self {
        Self {
            source,
            chunk_manager,
            work_dir,
        }
    }

    pub async fn download(&self, claim: ChunkClaim) -> Result<ChunkEnd, TransferError> {
        let path = self.work_dir.join(&claim.part_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let on_disk = file.metadata().await?.len();
        let mut offset = self.chunk_manager.rewind(claim.transfer_id, claim.index, on_disk)?;
        // without range support the only way to continue is from the first byte
        if !claim.accepts_ranges && offset > 0 {
            offset = self.chunk_manager.rewind(claim.transfer_id, claim.index, 0)?;
        }

        let span = match claim.range {
            _ if !claim.accepts_ranges => FetchSpan::Whole,
            Some(range) => match range.remaining(offset) {
                Some(rest) => FetchSpan::Range(rest),
                // everything is on disk already
                None => {
                    let outcome = self.chunk_manager.advance(claim.transfer_id, claim.index, 0)?;
                    return Ok(self.on_outcome(&claim, &path, outcome).await.unwrap_or(ChunkEnd::Requeue));
                }
            },
            None if offset == 0 => FetchSpan::Whole,
            None => FetchSpan::From(offset),
        };

        // drop anything past the recorded offset, it was never acknowledged
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        debug!("Chunk {} of {} fetching {:?}", claim.index, claim.transfer_id, span);

        let mut stream = select! {
            stream = self.source.fetch(&claim.url, span) => stream?,
            _ = claim.stop_token.cancelled() => return self.stopped(&claim, &path).await,
        };

        let mut remaining = claim.range.map(|range| range.len() - offset);
        loop {
            let item = select! {
                item = stream.next() => item,
                _ = claim.stop_token.cancelled() => return self.stopped(&claim, &path).await,
            };

            let mut bytes = match item {
                Some(bytes) => bytes?,
                None => break,
            };
            if let Some(left) = remaining.as_mut() {
                if bytes.len() as u64 > *left {
                    bytes.truncate(*left as usize);
                }
                *left -= bytes.len() as u64;
            }
            if bytes.is_empty() {
                continue;
            }

            file.write_all(&bytes).await?;
            file.flush().await?;

            let outcome = self.chunk_manager.advance(claim.transfer_id, claim.index, bytes.len() as u64)?;
            if let Some(end) = self.on_outcome(&claim, &path, outcome).await {
                file.sync_all().await?;
                return Ok(end);
            }
        }

        file.sync_all().await?;

        match claim.range {
            Some(range) => Err(TransferError::Network(format!(
                "Stream ended early: chunk {} of {} is missing {} of {} bytes",
                claim.index,
                claim.transfer_id,
                remaining.unwrap_or_default(),
                range.len()
            ))),
            None => {
                let outcome = self.chunk_manager.finish_stream(claim.transfer_id, claim.index)?;
                Ok(self.on_outcome(&claim, &path, outcome).await.unwrap_or(ChunkEnd::Requeue))
            }
        }
    }

    /// Map the coordinator's answer to how the worker ends. `None` means keep reading.
    async fn on_outcome(&self, claim: &ChunkClaim, path: &Path, outcome: AdvanceOutcome) -> Option<ChunkEnd> {
        match outcome {
            AdvanceOutcome::Progress => None,
            AdvanceOutcome::ChunkCompleted => {
                debug!("Chunk {} of {} completed", claim.index, claim.transfer_id);
                Some(ChunkEnd::Completed { ready_to_assemble: false })
            }
            AdvanceOutcome::ReadyToAssemble => {
                info!("All chunks of {} completed", claim.transfer_id);
                Some(ChunkEnd::Completed { ready_to_assemble: true })
            }
            AdvanceOutcome::Interrupted(DownloadEndCause::Canceled) => {
                remove_part(path).await;
                Some(ChunkEnd::Stopped(DownloadEndCause::Canceled))
            }
            AdvanceOutcome::Interrupted(cause) => Some(ChunkEnd::Stopped(cause)),
        }
    }

    async fn stopped(&self, claim: &ChunkClaim, path: &Path) -> Result<ChunkEnd, TransferError> {
        match self.chunk_manager.interrupt(claim.transfer_id, claim.index)? {
            InterruptOutcome::Requeue => Ok(ChunkEnd::Requeue),
            InterruptOutcome::Stopped(DownloadEndCause::Canceled) => {
                remove_part(path).await;
                Ok(ChunkEnd::Stopped(DownloadEndCause::Canceled))
            }
            InterruptOutcome::Stopped(cause) => Ok(ChunkEnd::Stopped(cause)),
        }
    }
}

async fn remove_part(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed part file {:?}", path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => debug!("Failed to remove part file {:?}: {}", path, err),
    }
}
