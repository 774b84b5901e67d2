//!
//! # 合并模块
//! Concatenates part files in ascending offset order into the library destination
//!

use std::path::{Path, PathBuf};

use log::{debug, info};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncWriteExt};

use crate::download::error::TransferError;
use crate::download::record::{Chunk, Transfer};

pub struct Assembler {
    work_dir: PathBuf,
    library_dir: PathBuf,
}

impl Assembler {
    pub fn new(work_dir: PathBuf, library_dir: PathBuf) -> Self {
        Self { work_dir, library_dir }
    }

    pub fn destination_path(&self, transfer: &Transfer) -> PathBuf {
        self.library_dir.join(&transfer.destination)
    }

    /// Library-relative path of the in-progress output
    pub fn staging_name(destination: &str) -> String {
        format!("{destination}.assembling")
    }

    /// Merge every chunk of `transfer` and move the result into place.
    ///
    /// The output is staged next to the destination and renamed only after its size
    /// matches the transfer's total, so a half-written destination never exists.
    pub async fn assemble(&self, transfer: &Transfer) -> Result<PathBuf, TransferError> {
        let destination = self.destination_path(transfer);
        let staging = self.library_dir.join(Self::staging_name(&transfer.destination));
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut chunks: Vec<&Chunk> = transfer.chunks.iter().collect();
        chunks.sort_by_key(|chunk| chunk.range.map(|range| range.start).unwrap_or_default());

        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging)
            .await?;

        let mut written = 0u64;
        for chunk in chunks {
            let part = self.work_dir.join(transfer.part_path(chunk.index));
            let mut input = File::open(&part).await?;
            let copied = io::copy(&mut input, &mut output).await?;
            debug!("Merged chunk {} of {} ({} bytes)", chunk.index, transfer.id, copied);
            written += copied;
        }
        output.flush().await?;
        output.sync_all().await?;
        drop(output);

        let expected = transfer.total_size.unwrap_or(written);
        if written != expected {
            remove_quietly(&staging).await;
            return Err(TransferError::SizeMismatch { expected, actual: written });
        }

        fs::rename(&staging, &destination).await?;
        remove_parts(&self.work_dir.join(transfer.parts_dir())).await;
        info!("Assembled {} into {:?} ({} bytes)", transfer.id, destination, written);

        Ok(destination)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!("Failed to remove {:?}: {}", path, err);
        }
    }
}

async fn remove_parts(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!("Failed to remove part directory {:?}: {}", dir, err);
        }
    }
}
